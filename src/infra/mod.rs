//! Infrastructure layer
//!
//! Handles all I/O operations: subprocess invocation of the nix toolchain
//! and everything that touches the store. This module is the only place
//! where external processes are spawned.

pub mod nix;
