//! Default configuration values

/// Lock file name inside a flake directory
pub const LOCK_FILE_NAME: &str = "flake.lock";

/// Flake definition file name
pub const FLAKE_FILE_NAME: &str = "flake.nix";

/// Lock file format version written and expected
pub const LOCK_FORMAT_VERSION: u32 = 7;

/// Default number of parallel evaluations for `flake show`
pub const DEFAULT_EVAL_JOBS: usize = 4;

/// Default number of parallel builds for `flake check`
pub const DEFAULT_CHECK_JOBS: usize = 1;

/// Global flake registry URL
pub const GLOBAL_REGISTRY_URL: &str = "https://channels.nixos.org/flake-registry.json";

/// Revision prefix length used in change summaries
pub const REV_DISPLAY_LEN: usize = 11;
