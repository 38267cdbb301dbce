//! External fetch gateway contract
//!
//! Resolving a flake reference to immutable coordinates is delegated to
//! `nix flake prefetch` (which handles revision resolution, authentication,
//! and hashing), and reading an upstream source's own `flake.lock` is
//! delegated to the legacy toolchain. Both operations sit behind this trait
//! so the synchronization engine can be exercised against a mock.

use serde::Deserialize;
use serde_json::Value;

use crate::core::closure::SourceArchive;
use crate::core::lock::SourceInfo;
use crate::error::GatewayError;

/// Result of prefetching one flake reference.
#[derive(Debug, Clone, Deserialize)]
pub struct PrefetchData {
    /// Content (NAR) hash of the fetched tree
    pub hash: String,

    /// Kind-specific resolved coordinates; canonicalization may differ
    /// from the request (e.g. case-normalized owner names)
    pub locked: SourceInfo,

    /// The gateway's own parse of the request. Used only as a fallback:
    /// the caller's declared spec is preferred when building `original`
    /// so user-declared ref/rev survive an override.
    #[serde(default)]
    pub original: SourceInfo,
}

/// Boundary to the external fetcher. Failures abort only the input being
/// processed; no retries happen at this layer.
pub trait FetchGateway {
    /// Resolve `reference` to immutable, content-addressed coordinates.
    fn prefetch(&self, reference: &str) -> Result<PrefetchData, GatewayError>;

    /// Fetch the source tree described by `archive` and return its parsed
    /// `flake.lock`, or `None` when the source carries no lock file.
    fn fetch_lock(&self, archive: &SourceArchive) -> Result<Option<Value>, GatewayError>;
}
