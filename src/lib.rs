//! Renix - Nix flakes on the legacy toolchain
//!
//! This library provides the core functionality for building, running, and
//! managing Nix flakes with `nix-build`/`nix-instantiate`/`nix-shell`
//! instead of the sandboxed `nix build`/`nix flake` commands, while staying
//! output-compatible with native flake tooling (flake.lock version 7).
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Business logic (lock synchronization, reference parsing)
//! - [`infra`] - Infrastructure layer (nix subprocesses, network)
//! - [`config`] - Configuration and constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;
