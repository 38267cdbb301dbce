//! Installable references
//!
//! An installable is `<flake-ref>#<attr-path>`: where to find a flake and
//! which output attribute to use. Local flakes (paths, and registry names
//! resolving to paths) are handled natively; anything else keeps its full
//! reference and is handed to the toolchain as-is.

use std::path::PathBuf;

use crate::core::registry::{self, Registry};
use crate::error::InstallableError;

/// Per-system output categories, completed with the current system.
const PER_SYSTEM_CATEGORIES: &[&str] = &[
    "packages",
    "devShells",
    "apps",
    "checks",
    "legacyPackages",
    "formatter",
];

/// Top-level output categories that never get a system segment.
const TOP_LEVEL_CATEGORIES: &[&str] = &[
    "lib",
    "overlays",
    "nixosModules",
    "nixosConfigurations",
    "darwinModules",
    "darwinConfigurations",
    "homeManagerModules",
    "templates",
    "defaultTemplate",
    "self",
];

/// Where an installable's flake lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlakeLocation {
    /// A flake directory on the local filesystem
    Local(PathBuf),

    /// A remote reference passed through to the toolchain
    Remote(String),
}

/// A resolved installable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installable {
    pub location: FlakeLocation,

    /// Attribute part after `#`, `default` when absent
    pub attr: String,
}

impl Installable {
    /// Resolve an installable string.
    ///
    /// `.`/empty means the current directory; explicit paths are expanded
    /// and absolutized; references containing `:` pass through; bare names
    /// go through the registry, where a path target is adopted as local.
    pub async fn resolve(raw: &str, registry: &Registry) -> Result<Self, InstallableError> {
        let (ref_part, attr) = split_attr(raw);

        if ref_part.is_empty() || ref_part == "." {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            return Ok(Self {
                location: FlakeLocation::Local(cwd),
                attr,
            });
        }

        if let Some(path) = explicit_path(ref_part) {
            return Ok(Self {
                location: FlakeLocation::Local(registry::absolute_path(&path)),
                attr,
            });
        }

        if ref_part.contains(':') {
            return Ok(Self {
                location: FlakeLocation::Remote(ref_part.to_string()),
                attr,
            });
        }

        if registry::is_registry_name(ref_part) {
            let Some(target) = registry.resolve(ref_part).await else {
                return Err(InstallableError::UnresolvedName {
                    name: ref_part.to_string(),
                });
            };
            let location = match (target.kind.as_str(), &target.path) {
                ("path", Some(path)) => FlakeLocation::Local(registry::absolute_path(path)),
                _ => FlakeLocation::Remote(target.to_flake_ref()),
            };
            return Ok(Self { location, attr });
        }

        Err(InstallableError::Invalid {
            reference: raw.to_string(),
        })
    }
}

/// Split `ref#attr`, defaulting the attribute to `default`.
pub fn split_attr(raw: &str) -> (&str, String) {
    match raw.split_once('#') {
        Some((ref_part, attr)) => (ref_part, attr.to_string()),
        None => (raw, "default".to_string()),
    }
}

fn explicit_path(ref_part: &str) -> Option<String> {
    if let Some(path) = ref_part.strip_prefix("path:") {
        return Some(path.to_string());
    }
    if ref_part.starts_with('/')
        || ref_part.starts_with("./")
        || ref_part.starts_with("../")
        || ref_part.starts_with('~')
    {
        return Some(ref_part.to_string());
    }
    None
}

/// Complete an attribute part to a full output path.
///
/// `hello` becomes `packages.<system>.hello` (or whatever the default
/// category is); per-system categories get the system inserted unless it
/// is already present; top-level categories and unknown dotted paths pass
/// through untouched.
pub fn resolve_attr_path(attr_part: &str, default_category: &str, system: &str) -> String {
    if !attr_part.contains('.') {
        return format!("{default_category}.{system}.{attr_part}");
    }

    let parts: Vec<&str> = attr_part.split('.').collect();
    let first = parts[0];

    if TOP_LEVEL_CATEGORIES.contains(&first) {
        return attr_part.to_string();
    }

    if PER_SYSTEM_CATEGORIES.contains(&first) {
        if parts.len() >= 3 && looks_like_system(parts[1]) {
            return attr_part.to_string();
        }
        return format!("{first}.{system}.{}", parts[1..].join("."));
    }

    attr_part.to_string()
}

/// Whether a category is keyed by system (`packages.<system>.*`).
pub fn is_per_system_category(name: &str) -> bool {
    PER_SYSTEM_CATEGORIES.contains(&name)
}

/// Heuristic for a system identifier like `x86_64-linux`.
fn looks_like_system(segment: &str) -> bool {
    segment.contains('-')
}
