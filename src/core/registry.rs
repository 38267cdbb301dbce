//! Flake registry resolution
//!
//! Resolves short names like `nixpkgs` to full flake references through the
//! three standard registries, searched in order: the user registry
//! (`$XDG_CONFIG_HOME/nix/registry.json`), the system registry
//! (`/etc/nix/registry.json`), and the global registry fetched over HTTP.
//! `add`/`remove` mutate the user registry only.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::defaults::GLOBAL_REGISTRY_URL;
use crate::core::flake_ref::FlakeRef;
use crate::error::RegistryError;

/// Registry file format version written for new user registries.
const REGISTRY_FORMAT_VERSION: u32 = 2;

/// One side of a registry mapping (`from` or `to`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryRef {
    #[serde(rename = "type")]
    pub kind: String,

    /// Short name, for `type: indirect` entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, serde_json::Value>,
}

impl RegistryRef {
    /// Flake reference string for this target. A pinned revision wins over
    /// a ref name.
    pub fn to_flake_ref(&self) -> String {
        match self.kind.as_str() {
            "path" => self.path.clone().unwrap_or_default(),
            "github" => {
                let mut reference = format!(
                    "github:{}/{}",
                    self.owner.as_deref().unwrap_or_default(),
                    self.repo.as_deref().unwrap_or_default(),
                );
                if let Some(pin) = self.rev.as_deref().or(self.ref_name.as_deref()) {
                    reference.push('/');
                    reference.push_str(pin);
                }
                reference
            }
            "git" => {
                let mut reference = format!("git+{}", self.url.as_deref().unwrap_or_default());
                let mut params = Vec::new();
                if let Some(ref_name) = &self.ref_name {
                    params.push(format!("ref={ref_name}"));
                }
                if let Some(rev) = &self.rev {
                    params.push(format!("rev={rev}"));
                }
                if !params.is_empty() {
                    reference.push('?');
                    reference.push_str(&params.join("&"));
                }
                reference
            }
            _ => String::new(),
        }
    }
}

/// A `from`/`to` pair in a registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub from: RegistryRef,
    pub to: RegistryRef,
}

/// On-disk registry file shape, shared by all three tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub flakes: Vec<RegistryEntry>,
}

/// Which registry tier an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySource {
    User,
    System,
    Global,
}

impl std::fmt::Display for RegistrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::System => write!(f, "system"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// The three-tier registry.
#[derive(Debug, Clone)]
pub struct Registry {
    user_path: PathBuf,
    system_path: PathBuf,
    global_url: String,
}

impl Default for Registry {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Registry {
    /// Registry rooted at the standard locations.
    pub fn from_env() -> Self {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("~/.config"));
        Self {
            user_path: config_dir.join("nix").join("registry.json"),
            system_path: PathBuf::from("/etc/nix/registry.json"),
            global_url: GLOBAL_REGISTRY_URL.to_string(),
        }
    }

    /// Registry with explicit locations, for tests.
    pub fn with_locations(user_path: PathBuf, system_path: PathBuf, global_url: String) -> Self {
        Self {
            user_path,
            system_path,
            global_url,
        }
    }

    /// Resolve a short name, searching user, then system, then global.
    pub async fn resolve(&self, name: &str) -> Option<RegistryRef> {
        for file in [
            load_registry_file(&self.user_path),
            load_registry_file(&self.system_path),
        ] {
            if let Some(target) = search(&file, name) {
                return Some(target);
            }
        }
        search(&self.fetch_global().await, name)
    }

    /// Every entry from every tier, in precedence order.
    pub async fn list(&self) -> Vec<(String, RegistrySource, RegistryRef)> {
        let mut entries = Vec::new();
        collect(
            &load_registry_file(&self.user_path),
            RegistrySource::User,
            &mut entries,
        );
        collect(
            &load_registry_file(&self.system_path),
            RegistrySource::System,
            &mut entries,
        );
        collect(&self.fetch_global().await, RegistrySource::Global, &mut entries);
        entries
    }

    /// Add (or replace) a user registry entry mapping `name` to `target`.
    pub fn add(&self, name: &str, target: &str) -> Result<(), RegistryError> {
        let mut file = load_registry_file(&self.user_path);
        if file.version == 0 {
            file.version = REGISTRY_FORMAT_VERSION;
        }
        file.flakes.retain(|entry| !matches_name(entry, name));
        file.flakes.push(RegistryEntry {
            from: RegistryRef {
                kind: "indirect".into(),
                id: Some(name.to_string()),
                ..RegistryRef::default()
            },
            to: target_to_registry_ref(target),
        });
        self.save_user(&file)
    }

    /// Remove a user registry entry. Returns whether it existed.
    pub fn remove(&self, name: &str) -> Result<bool, RegistryError> {
        let mut file = load_registry_file(&self.user_path);
        let before = file.flakes.len();
        file.flakes.retain(|entry| !matches_name(entry, name));
        if file.flakes.len() == before {
            return Ok(false);
        }
        self.save_user(&file)?;
        Ok(true)
    }

    /// Fetch the global registry; failures degrade to an empty registry
    /// with a warning, never an error.
    async fn fetch_global(&self) -> RegistryFile {
        match self.try_fetch_global().await {
            Ok(file) => file,
            Err(err) => {
                warn!("{err}");
                RegistryFile::default()
            }
        }
    }

    async fn try_fetch_global(&self) -> Result<RegistryFile, RegistryError> {
        debug!("fetching global registry from {}", self.global_url);
        let response = reqwest::get(&self.global_url)
            .await
            .map_err(|e| RegistryError::Fetch(e.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|e| RegistryError::Fetch(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| RegistryError::Fetch(e.to_string()))
    }

    fn save_user(&self, file: &RegistryFile) -> Result<(), RegistryError> {
        if let Some(parent) = self.user_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::Write {
                path: self.user_path.clone(),
                message: e.to_string(),
            })?;
        }
        let mut text =
            serde_json::to_string_pretty(file).map_err(|e| RegistryError::Write {
                path: self.user_path.clone(),
                message: e.to_string(),
            })?;
        text.push('\n');
        std::fs::write(&self.user_path, text).map_err(|e| RegistryError::Write {
            path: self.user_path.clone(),
            message: e.to_string(),
        })
    }
}

/// Whether a reference looks like a bare registry name (`nixpkgs`,
/// `home-manager`) rather than a path or a full reference.
pub fn is_registry_name(reference: &str) -> bool {
    if reference.is_empty()
        || reference.starts_with('.')
        || reference.starts_with('/')
        || reference.starts_with('~')
        || reference.contains(':')
    {
        return false;
    }
    let base = reference.split('#').next().unwrap_or_default();
    !base.is_empty()
        && base
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// Expand a leading `~` to the home directory and make the path absolute.
pub(crate) fn absolute_path(raw: &str) -> PathBuf {
    let expanded = if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("~"))
            .join(rest)
    } else if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else {
        PathBuf::from(raw)
    };
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    }
}

fn load_registry_file(path: &Path) -> RegistryFile {
    let Ok(text) = std::fs::read_to_string(path) else {
        return RegistryFile::default();
    };
    serde_json::from_str(&text).unwrap_or_else(|err| {
        warn!("ignoring malformed registry '{}': {err}", path.display());
        RegistryFile::default()
    })
}

fn matches_name(entry: &RegistryEntry, name: &str) -> bool {
    entry.from.kind == "indirect" && entry.from.id.as_deref() == Some(name)
}

fn search(file: &RegistryFile, name: &str) -> Option<RegistryRef> {
    file.flakes
        .iter()
        .find(|entry| matches_name(entry, name))
        .map(|entry| entry.to.clone())
}

fn collect(
    file: &RegistryFile,
    source: RegistrySource,
    entries: &mut Vec<(String, RegistrySource, RegistryRef)>,
) {
    for entry in &file.flakes {
        if entry.from.kind == "indirect" {
            if let Some(id) = &entry.from.id {
                entries.push((id.clone(), source, entry.to.clone()));
            }
        }
    }
}

/// Parse a target reference into a registry `to` entry. Unrecognized
/// references are treated as filesystem paths, matching `nix registry add`.
fn target_to_registry_ref(target: &str) -> RegistryRef {
    match FlakeRef::parse(target) {
        FlakeRef::GitHub {
            owner,
            repo,
            ref_name,
            rev,
        } => RegistryRef {
            kind: "github".into(),
            owner: Some(owner),
            repo: Some(repo),
            ref_name,
            rev,
            ..RegistryRef::default()
        },
        FlakeRef::Git { url, ref_name, rev } => RegistryRef {
            kind: "git".into(),
            url: Some(url),
            ref_name,
            rev,
            ..RegistryRef::default()
        },
        FlakeRef::Path { path } => RegistryRef {
            kind: "path".into(),
            path: Some(absolute_path(&path).to_string_lossy().into_owned()),
            ..RegistryRef::default()
        },
        FlakeRef::Unknown { url } => RegistryRef {
            kind: "path".into(),
            path: Some(absolute_path(&url).to_string_lossy().into_owned()),
            ..RegistryRef::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_registry_name() {
        assert!(is_registry_name("nixpkgs"));
        assert!(is_registry_name("home-manager"));
        assert!(is_registry_name("my_flake#hello"));

        assert!(!is_registry_name(""));
        assert!(!is_registry_name("."));
        assert!(!is_registry_name("./flake"));
        assert!(!is_registry_name("/abs"));
        assert!(!is_registry_name("~/flake"));
        assert!(!is_registry_name("github:NixOS/nixpkgs"));
        assert!(!is_registry_name("#attr"));
    }

    #[test]
    fn test_to_flake_ref_github_rev_wins() {
        let target = RegistryRef {
            kind: "github".into(),
            owner: Some("NixOS".into()),
            repo: Some("nixpkgs".into()),
            ref_name: Some("nixos-unstable".into()),
            rev: Some("abc123".into()),
            ..RegistryRef::default()
        };
        assert_eq!(target.to_flake_ref(), "github:NixOS/nixpkgs/abc123");
    }

    #[test]
    fn test_to_flake_ref_git_params() {
        let target = RegistryRef {
            kind: "git".into(),
            url: Some("https://example.com/r.git".into()),
            ref_name: Some("main".into()),
            ..RegistryRef::default()
        };
        assert_eq!(
            target.to_flake_ref(),
            "git+https://example.com/r.git?ref=main"
        );
    }

    #[test]
    fn test_target_to_registry_ref_github() {
        let target = target_to_registry_ref("github:NixOS/nixpkgs/nixos-24.05");
        assert_eq!(target.kind, "github");
        assert_eq!(target.owner.as_deref(), Some("NixOS"));
        assert_eq!(target.ref_name.as_deref(), Some("nixos-24.05"));
    }

    #[test]
    fn test_target_to_registry_ref_path_is_absolute() {
        let target = target_to_registry_ref("./somewhere");
        let path = target.path.unwrap();
        assert_eq!(target.kind, "path");
        assert!(PathBuf::from(path).is_absolute());
    }

    #[test]
    fn test_add_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::with_locations(
            dir.path().join("registry.json"),
            dir.path().join("missing-system.json"),
            "http://127.0.0.1:1/registry.json".into(),
        );

        registry.add("mine", "github:me/mine").unwrap();
        let file = load_registry_file(&dir.path().join("registry.json"));
        assert_eq!(file.version, 2);
        assert_eq!(file.flakes.len(), 1);
        assert_eq!(file.flakes[0].from.id.as_deref(), Some("mine"));

        // Replaces rather than duplicates
        registry.add("mine", "github:me/other").unwrap();
        let file = load_registry_file(&dir.path().join("registry.json"));
        assert_eq!(file.flakes.len(), 1);
        assert_eq!(file.flakes[0].to.repo.as_deref(), Some("other"));

        assert!(registry.remove("mine").unwrap());
        assert!(!registry.remove("mine").unwrap());
    }
}
