//! Package profile management
//!
//! Maintains a nix-profile-compatible `manifest.json` (format version 3)
//! and the generation symlink chain: `profile-N-link` points at a profile
//! store path, and the `profile` symlink is atomically renamed onto the
//! current generation. Building packages and `nix-store --add` go through
//! the toolchain wrapper; everything in this module is manifest and
//! symlink bookkeeping.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::ProfileError;

/// Manifest format version written and expected.
pub const MANIFEST_VERSION: u32 = 3;

/// Manifest file name inside a profile store path.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    5
}

/// One installed package, keyed by name in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileElement {
    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default)]
    pub store_paths: Vec<String>,

    #[serde(default)]
    pub original_url: String,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub attr_path: String,
}

impl ProfileElement {
    /// A freshly installed element with default activation and priority.
    pub fn new(store_path: String, original_url: String, attr_path: String) -> Self {
        Self {
            active: true,
            priority: default_priority(),
            store_paths: vec![store_path],
            url: original_url.clone(),
            original_url,
            attr_path,
        }
    }
}

/// The profile manifest: every installed package with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub elements: BTreeMap<String, ProfileElement>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            elements: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Read the manifest of a profile store path, tolerating absence and
    /// malformed content the way the lock store does.
    pub fn load(profile_store_path: &Path) -> Self {
        fs::read_to_string(profile_store_path.join(MANIFEST_FILE_NAME))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    /// Resolve a user-supplied package name to a manifest key.
    ///
    /// Exact matches win; otherwise a substring match is accepted when it
    /// is unique. Bare generation indices are rejected up front.
    pub fn resolve_name(&self, name: &str) -> Result<String, ProfileError> {
        if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProfileError::IndexUnsupported {
                name: name.to_string(),
            });
        }
        if self.elements.contains_key(name) {
            return Ok(name.to_string());
        }
        let matches: Vec<&String> = self
            .elements
            .keys()
            .filter(|key| key.contains(name))
            .collect();
        match matches.as_slice() {
            [only] => Ok((*only).clone()),
            [] => Err(ProfileError::PackageNotFound {
                name: name.to_string(),
            }),
            many => Err(ProfileError::AmbiguousPackage {
                name: name.to_string(),
                matches: many
                    .iter()
                    .map(|key| key.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Every store path referenced by the manifest, in element order.
    pub fn store_paths(&self) -> Vec<String> {
        self.elements
            .values()
            .flat_map(|element| element.store_paths.iter().cloned())
            .collect()
    }

    /// Elements installed from local paths (`path:` URLs), optionally
    /// filtered to one name or name fragment.
    pub fn local_elements(&self, filter: Option<&str>) -> Vec<(String, ProfileElement)> {
        self.elements
            .iter()
            .filter(|(_, element)| element.original_url.starts_with("path:"))
            .filter(|(name, _)| match filter {
                None => true,
                Some(fragment) => name.as_str() == fragment || name.contains(fragment),
            })
            .map(|(name, element)| (name.clone(), element.clone()))
            .collect()
    }

    /// Active package versions, for generation history output.
    pub fn active_versions(&self) -> BTreeMap<String, String> {
        self.elements
            .iter()
            .filter(|(_, element)| element.active)
            .map(|(name, element)| {
                let version = element
                    .store_paths
                    .first()
                    .map_or_else(|| String::from("unknown"), |path| display_version(path));
                (name.clone(), version)
            })
            .collect()
    }
}

/// The flake directory a `path:` element was installed from.
pub fn local_flake_dir(element: &ProfileElement) -> Option<PathBuf> {
    let rest = element.original_url.strip_prefix("path:")?;
    Some(PathBuf::from(rest.split('?').next()?))
}

/// One generation symlink (`profile-N-link`) and its resolved target.
#[derive(Debug, Clone)]
pub struct Generation {
    pub number: u32,
    pub link: PathBuf,
    pub target: PathBuf,
    pub modified: Option<SystemTime>,
}

/// A user profile: the user-facing symlink plus the directory where its
/// generation links live.
#[derive(Debug, Clone)]
pub struct Profile {
    link: PathBuf,
    dir: PathBuf,
}

impl Profile {
    /// The active user profile: `$NIX_PROFILE` or `~/.nix-profile`,
    /// with generations next to the symlink's target. Without an existing
    /// symlink the conventional per-user directory is assumed.
    pub fn from_env() -> Self {
        let link = std::env::var_os("NIX_PROFILE").map_or_else(
            || {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".nix-profile")
            },
            PathBuf::from,
        );
        let dir = match fs::read_link(&link) {
            Ok(target) => {
                let absolute = if target.is_absolute() {
                    target
                } else {
                    link.parent().unwrap_or(Path::new(".")).join(target)
                };
                match absolute.parent() {
                    Some(parent) => parent.to_path_buf(),
                    None => absolute,
                }
            }
            Err(_) => {
                let user = std::env::var("USER").unwrap_or_else(|_| String::from("default"));
                PathBuf::from(format!("/nix/var/nix/profiles/per-user/{user}"))
            }
        };
        Self { link, dir }
    }

    /// A profile rooted at explicit locations.
    pub fn at(link: PathBuf, dir: PathBuf) -> Self {
        Self { link, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store path of the current generation, when one exists.
    pub fn current_store_path(&self) -> Option<PathBuf> {
        fs::canonicalize(&self.link).ok()
    }

    /// Manifest of the current generation; empty when none exists.
    pub fn manifest(&self) -> Manifest {
        self.current_store_path()
            .map(|path| Manifest::load(&path))
            .unwrap_or_default()
    }

    /// All generation links, sorted by generation number. Broken links
    /// are skipped.
    pub fn generations(&self) -> Vec<Generation> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut generations: Vec<Generation> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let number = parse_generation_number(&name)?;
                let link = entry.path();
                let target = fs::canonicalize(&link).ok()?;
                let modified = link
                    .symlink_metadata()
                    .ok()
                    .and_then(|meta| meta.modified().ok());
                Some(Generation {
                    number,
                    link,
                    target,
                    modified,
                })
            })
            .collect();
        generations.sort_by_key(|generation| generation.number);
        generations
    }

    /// The number the next generation will get. Counts every generation
    /// link by name, so a broken link still reserves its number.
    pub fn next_generation_number(&self) -> u32 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 1;
        };
        entries
            .flatten()
            .filter_map(|entry| {
                parse_generation_number(&entry.file_name().to_string_lossy())
            })
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Record a new generation pointing at `store_path` and switch the
    /// `profile` symlink onto it atomically. Returns the new number.
    pub fn switch_to(&self, store_path: &Path) -> Result<u32, ProfileError> {
        fs::create_dir_all(&self.dir).map_err(|e| ProfileError::Switch {
            message: e.to_string(),
        })?;
        let number = self.next_generation_number();
        let generation_name = format!("profile-{number}-link");
        symlink(store_path, self.dir.join(&generation_name)).map_err(|e| {
            ProfileError::Switch {
                message: e.to_string(),
            }
        })?;
        // A rename over the live symlink is atomic; a direct re-link is not
        let tmp = self.dir.join(format!("profile-{number}-tmp"));
        symlink(&generation_name, &tmp).map_err(|e| ProfileError::Switch {
            message: e.to_string(),
        })?;
        fs::rename(&tmp, self.dir.join("profile")).map_err(|e| ProfileError::Switch {
            message: e.to_string(),
        })?;
        Ok(number)
    }

    /// Switch back to the generation before the current one. The rollback
    /// itself becomes a new generation, so it can in turn be rolled back.
    /// Returns the number of the generation whose contents were restored.
    pub fn rollback(&self) -> Result<u32, ProfileError> {
        let generations = self.generations();
        let current = self
            .current_store_path()
            .ok_or(ProfileError::NoPreviousGeneration)?;
        let index = generations
            .iter()
            .position(|generation| generation.target == current)
            .ok_or(ProfileError::NoPreviousGeneration)?;
        if index == 0 {
            return Err(ProfileError::NoPreviousGeneration);
        }
        let previous = &generations[index - 1];
        self.switch_to(&previous.target)?;
        Ok(previous.number)
    }
}

/// Parse the generation number out of a `profile-N-link` file name.
pub fn parse_generation_number(name: &str) -> Option<u32> {
    name.strip_prefix("profile-")?
        .strip_suffix("-link")?
        .parse()
        .ok()
}

/// Stage a profile tree under `staging_dir`: the compact manifest plus
/// symlinks to every package's contents, merging directories that more
/// than one package provides. Returns the staged root, ready for
/// `nix-store --add`.
pub fn stage_profile(
    manifest: &Manifest,
    store_paths: &[String],
    staging_dir: &Path,
) -> Result<PathBuf, ProfileError> {
    let root = staging_dir.join("profile");
    let stage_err = |e: std::io::Error| ProfileError::Stage {
        path: root.clone(),
        message: e.to_string(),
    };
    fs::create_dir(&root).map_err(stage_err)?;
    fs::write(
        root.join(MANIFEST_FILE_NAME),
        serde_json::to_string(manifest)?,
    )
    .map_err(stage_err)?;

    for (name, targets) in collect_package_paths(store_paths) {
        if let [only] = targets.as_slice() {
            symlink(only, root.join(&name)).map_err(stage_err)?;
            continue;
        }
        let merged = root.join(&name);
        fs::create_dir(&merged).map_err(stage_err)?;
        for target in &targets {
            if target.is_dir() {
                for item in fs::read_dir(target).map_err(stage_err)?.flatten() {
                    let dest = merged.join(item.file_name());
                    // First provider wins, matching symlink-join semantics
                    if dest.symlink_metadata().is_err() {
                        symlink(item.path(), dest).map_err(stage_err)?;
                    }
                }
            } else {
                let dest = merged.join(target.file_name().unwrap_or_default());
                if dest.symlink_metadata().is_err() {
                    symlink(target, dest).map_err(stage_err)?;
                }
            }
        }
    }
    Ok(root)
}

/// Top-level entries of every package, grouped by name so shared
/// directories (usually `bin/`) can be merged.
fn collect_package_paths(store_paths: &[String]) -> BTreeMap<String, Vec<PathBuf>> {
    let mut entries: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for store_path in store_paths {
        let Ok(items) = fs::read_dir(Path::new(store_path)) else {
            continue;
        };
        for item in items.flatten() {
            let name = item.file_name().to_string_lossy().into_owned();
            if name == MANIFEST_FILE_NAME {
                continue;
            }
            entries.entry(name).or_default().push(item.path());
        }
    }
    entries
}

/// Basename of a store path with the 32-character hash prefix removed.
fn strip_hash(store_path: &str) -> Option<&str> {
    let basename = Path::new(store_path).file_name()?.to_str()?;
    if basename.len() > 33 && basename.as_bytes()[32] == b'-' {
        Some(&basename[33..])
    } else {
        None
    }
}

/// Package name parsed from a store path basename
/// (`/nix/store/<hash>-<name>-<version>` yields `<name>`).
pub fn store_path_package_name(store_path: &str) -> String {
    let Some(name_version) = strip_hash(store_path) else {
        return Path::new(store_path)
            .file_name()
            .map_or_else(|| store_path.to_string(), |n| n.to_string_lossy().into_owned());
    };
    let bytes = name_version.as_bytes();
    for i in 1..bytes.len().saturating_sub(1) {
        if bytes[i] == b'-' && bytes[i + 1].is_ascii_digit() {
            return name_version[..i].to_string();
        }
    }
    name_version.to_string()
}

/// Human-readable version of a store path, for history output. Falls
/// back to the whole name-version part when no dotted version is found.
pub fn display_version(store_path: &str) -> String {
    let Some(name_version) = strip_hash(store_path) else {
        return store_path.to_string();
    };
    version_suffix(name_version)
        .unwrap_or(name_version)
        .to_string()
}

/// The suffix after the first `-<digits>.<digit>` boundary, when present.
fn version_suffix(name_version: &str) -> Option<&str> {
    for (i, byte) in name_version.bytes().enumerate() {
        if byte != b'-' {
            continue;
        }
        let rest = &name_version[i + 1..];
        let Some((major, minor)) = rest.split_once('.') else {
            continue;
        };
        if !major.is_empty()
            && major.bytes().all(|b| b.is_ascii_digit())
            && minor.bytes().next().is_some_and(|b| b.is_ascii_digit())
        {
            return Some(rest);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(original_url: &str, store_path: &str) -> ProfileElement {
        ProfileElement::new(
            store_path.to_string(),
            original_url.to_string(),
            String::new(),
        )
    }

    #[test]
    fn test_parse_generation_number() {
        assert_eq!(parse_generation_number("profile-42-link"), Some(42));
        assert_eq!(parse_generation_number("profile-1-link"), Some(1));
        assert_eq!(parse_generation_number("profile"), None);
        assert_eq!(parse_generation_number("profile-x-link"), None);
        assert_eq!(parse_generation_number("profile-3-tmp"), None);
        assert_eq!(parse_generation_number("other-3-link"), None);
    }

    #[test]
    fn test_resolve_name_exact_and_partial() {
        let mut manifest = Manifest::default();
        manifest
            .elements
            .insert("hello".into(), element("path:/src/hello", "/nix/store/x-hello-1.0"));
        manifest
            .elements
            .insert("cowsay".into(), element("path:/src/cowsay", "/nix/store/x-cowsay-3.04"));

        assert_eq!(manifest.resolve_name("hello").unwrap(), "hello");
        assert_eq!(manifest.resolve_name("cow").unwrap(), "cowsay");
        assert!(matches!(
            manifest.resolve_name("missing"),
            Err(ProfileError::PackageNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_name_ambiguous() {
        let mut manifest = Manifest::default();
        manifest
            .elements
            .insert("hello".into(), element("path:/a", "/nix/store/x-hello-1.0"));
        manifest
            .elements
            .insert("hello-wayland".into(), element("path:/b", "/nix/store/x-hw-1.0"));
        assert!(matches!(
            manifest.resolve_name("hell"),
            Err(ProfileError::AmbiguousPackage { .. })
        ));
    }

    #[test]
    fn test_resolve_name_rejects_indices() {
        let manifest = Manifest::default();
        assert!(matches!(
            manifest.resolve_name("3"),
            Err(ProfileError::IndexUnsupported { .. })
        ));
    }

    #[test]
    fn test_manifest_defaults_fill_in() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"version": 3, "elements": {"hello": {"storePaths": ["/nix/store/x-hello-1.0"]}}}"#,
        )
        .unwrap();
        let hello = &manifest.elements["hello"];
        assert!(hello.active);
        assert_eq!(hello.priority, 5);
        assert_eq!(hello.attr_path, "");
    }

    #[test]
    fn test_manifest_serializes_camel_case() {
        let mut manifest = Manifest::default();
        manifest.elements.insert(
            "hello".into(),
            ProfileElement::new(
                "/nix/store/x-hello-1.0".into(),
                "path:/src/hello".into(),
                "packages.x86_64-linux.hello".into(),
            ),
        );
        let text = serde_json::to_string(&manifest).unwrap();
        assert!(text.contains("\"storePaths\""));
        assert!(text.contains("\"originalUrl\""));
        assert!(text.contains("\"attrPath\""));
    }

    #[test]
    fn test_local_elements_filters_path_urls() {
        let mut manifest = Manifest::default();
        manifest
            .elements
            .insert("hello".into(), element("path:/src/hello", "/nix/store/x-hello-1.0"));
        manifest
            .elements
            .insert("remote".into(), element("github:o/r", "/nix/store/x-remote-2.0"));

        let all: Vec<String> = manifest
            .local_elements(None)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(all, ["hello"]);
        assert!(manifest.local_elements(Some("remote")).is_empty());
        assert_eq!(manifest.local_elements(Some("hel")).len(), 1);
    }

    #[test]
    fn test_local_flake_dir_strips_query() {
        let e = element("path:/src/hello?dir=sub", "/nix/store/x");
        assert_eq!(local_flake_dir(&e), Some(PathBuf::from("/src/hello")));
        let e = element("github:o/r", "/nix/store/x");
        assert_eq!(local_flake_dir(&e), None);
    }

    #[test]
    fn test_store_path_package_name() {
        assert_eq!(
            store_path_package_name(
                "/nix/store/ld5p14p1a5k2zin7aw90na5mv71k311m-hello-2.12.1"
            ),
            "hello"
        );
        assert_eq!(
            store_path_package_name(
                "/nix/store/ld5p14p1a5k2zin7aw90na5mv71k311m-glibc-2.40-66"
            ),
            "glibc"
        );
        // No hash prefix: the basename is taken as-is
        assert_eq!(store_path_package_name("/tmp/hello"), "hello");
    }

    #[test]
    fn test_display_version() {
        assert_eq!(
            display_version("/nix/store/ld5p14p1a5k2zin7aw90na5mv71k311m-hello-2.12.1"),
            "2.12.1"
        );
        assert_eq!(
            display_version("/nix/store/ld5p14p1a5k2zin7aw90na5mv71k311m-glibc-2.40-66"),
            "2.40-66"
        );
        // No dotted version: the whole name-version part is shown
        assert_eq!(
            display_version("/nix/store/ld5p14p1a5k2zin7aw90na5mv71k311m-unversioned"),
            "unversioned"
        );
    }

    #[test]
    fn test_active_versions_skips_inactive() {
        let mut manifest = Manifest::default();
        manifest.elements.insert(
            "hello".into(),
            element("path:/a", "/nix/store/ld5p14p1a5k2zin7aw90na5mv71k311m-hello-2.12.1"),
        );
        let mut off = element("path:/b", "/nix/store/ld5p14p1a5k2zin7aw90na5mv71k311m-off-1.0");
        off.active = false;
        manifest.elements.insert("off".into(), off);

        let versions = manifest.active_versions();
        assert_eq!(versions.get("hello").map(String::as_str), Some("2.12.1"));
        assert!(!versions.contains_key("off"));
    }
}
