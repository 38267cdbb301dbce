//! Error types for renix
//!
//! Domain-specific error types using thiserror. Recoverable conditions
//! (skipped closure branches, version mismatches) are reported through
//! `tracing` warnings instead and never surface here.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the external fetch gateway.
///
/// A gateway failure aborts only the input being processed; callers decide
/// whether that input was fatal to the run.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// `nix flake prefetch` failed or produced unusable output
    #[error("prefetch of '{reference}' failed: {message}")]
    Prefetch { reference: String, message: String },

    /// Fetching an upstream source tree failed
    #[error("failed to fetch source tree from {location}: {message}")]
    FetchTree { location: String, message: String },
}

/// Lock synchronization errors (fatal to the whole run)
#[derive(Error, Debug)]
pub enum LockError {
    /// A top-level declared input could not be resolved
    #[error("failed to lock input '{name}' ({reference}): {message}")]
    InputFetch {
        name: String,
        reference: String,
        message: String,
    },

    /// An override or update names an input the flake does not declare
    #[error("input '{name}' not found in flake.nix")]
    UnknownInput { name: String },

    /// Overrides are only supported for github and git sources
    #[error("cannot override input '{name}': source type '{kind}' does not support overrides")]
    UnsupportedOverride { name: String, kind: String },

    /// Lock document serialization error
    #[error("failed to serialize lock document: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Lock file write error
    #[error("failed to write lock file '{path}': {message}")]
    Write { path: PathBuf, message: String },
}

/// Nix toolchain invocation errors
#[derive(Error, Debug)]
pub enum NixError {
    /// A required toolchain binary is not on PATH
    #[error("'{tool}' not found on PATH; is nix installed?")]
    ToolchainMissing { tool: String },

    /// The subprocess could not be spawned
    #[error("failed to run {command}: {message}")]
    Spawn { command: String, message: String },

    /// The subprocess exited with a non-zero status
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// The subprocess output could not be parsed
    #[error("failed to parse {command} output: {message}")]
    Parse { command: String, message: String },
}

/// Installable resolution errors
#[derive(Error, Debug)]
pub enum InstallableError {
    /// A bare name matched no registry entry
    #[error("cannot resolve '{name}': not found in any flake registry")]
    UnresolvedName { name: String },

    /// The reference is neither a path, a full reference, nor a registry name
    #[error("'{reference}' is not a valid installable reference")]
    Invalid { reference: String },
}

/// Package profile errors
#[derive(Error, Debug)]
pub enum ProfileError {
    /// Profiles are addressed by name, never by generation index
    #[error("'renix profile' does not support indices ('{name}')")]
    IndexUnsupported { name: String },

    /// The name matches no installed package
    #[error("package '{name}' not found in profile")]
    PackageNotFound { name: String },

    /// A partial name matches more than one installed package
    #[error("ambiguous package name '{name}', matches: {matches}")]
    AmbiguousPackage { name: String, matches: String },

    /// Rollback with fewer than two known generations
    #[error("no previous generation to roll back to")]
    NoPreviousGeneration,

    /// Building the staged profile tree failed
    #[error("failed to stage profile at '{path}': {message}")]
    Stage { path: PathBuf, message: String },

    /// Creating or renaming the generation symlinks failed
    #[error("failed to switch profile generation: {message}")]
    Switch { message: String },

    /// Manifest serialization error
    #[error("failed to serialize profile manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Flake registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Registry file read error
    #[error("failed to read registry '{path}': {message}")]
    Read { path: PathBuf, message: String },

    /// Registry file write error
    #[error("failed to write registry '{path}': {message}")]
    Write { path: PathBuf, message: String },

    /// Global registry fetch error
    #[error("failed to fetch global registry: {0}")]
    Fetch(String),
}
