//! Lock document model and store
//!
//! The lock file (flake.lock, format version 7) records the exact immutable
//! revision of every input. It is shared with native nix, so serialization
//! must match what nix itself accepts: sorted keys, two-space indentation,
//! one trailing newline, and no `null` value anywhere in the tree.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::defaults::LOCK_FORMAT_VERSION;
use crate::error::LockError;

/// Name of the distinguished root node.
pub const ROOT_NODE: &str = "root";

/// Reference from a node's `inputs` table to another node.
///
/// Serialized untagged: a plain string names a sibling node, a list is a
/// follows path resolved by the consumer one hop at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputRef {
    /// Direct reference to a sibling node by name
    Node(String),
    /// Follows path (`["nixpkgs"]`, `["parent", "nixpkgs"]`, ...)
    Follows(Vec<String>),
}

/// Kind-specific source coordinates (the `locked` and `original` tables).
///
/// Every field is optional except `type`; absent fields are omitted from
/// serialization, never written as null. Fields we do not model are kept
/// verbatim in `extra` so transitive nodes copied from upstream locks
/// round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(rename = "narHash", skip_serializing_if = "Option::is_none")]
    pub nar_hash: Option<String>,

    #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,

    #[serde(rename = "revCount", skip_serializing_if = "Option::is_none")]
    pub rev_count: Option<u64>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SourceInfo {
    /// Display form of the coordinates, matching nix's summaries
    /// (`github:owner/repo/rev`, `git+url?rev=..`, `path:dir`).
    pub fn summary(&self) -> String {
        match self.kind.as_str() {
            "github" => format!(
                "github:{}/{}/{}",
                self.owner.as_deref().unwrap_or_default(),
                self.repo.as_deref().unwrap_or_default(),
                self.rev.as_deref().unwrap_or_default(),
            ),
            "git" => format!(
                "git+{}?rev={}",
                self.url.as_deref().unwrap_or_default(),
                self.rev.as_deref().unwrap_or_default(),
            ),
            "path" => format!("path:{}", self.path.as_deref().unwrap_or_default()),
            _ => serde_json::to_string(self).unwrap_or_else(|_| self.kind.clone()),
        }
    }
}

fn is_true(value: &bool) -> bool {
    *value
}

fn default_true() -> bool {
    true
}

fn default_root() -> String {
    ROOT_NODE.to_string()
}

/// A single entry in the lock document.
///
/// The root node carries only `inputs`; every other node has `locked` and
/// `original` coordinates. `flake` is omitted when true, which is the
/// implicit default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<SourceInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub original: Option<SourceInfo>,

    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub flake: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<String, InputRef>>,
}

impl Default for LockNode {
    fn default() -> Self {
        Self {
            locked: None,
            original: None,
            flake: true,
            inputs: None,
        }
    }
}

impl LockNode {
    /// A fresh root node with an empty (but present) `inputs` table.
    pub fn root() -> Self {
        Self {
            inputs: Some(BTreeMap::new()),
            ..Self::default()
        }
    }

    /// The follows overrides recorded on this node (list-valued entries).
    pub fn follows_inputs(&self) -> BTreeMap<String, Vec<String>> {
        self.inputs
            .iter()
            .flatten()
            .filter_map(|(name, reference)| match reference {
                InputRef::Follows(path) => Some((name.clone(), path.clone())),
                InputRef::Node(_) => None,
            })
            .collect()
    }

    /// The transitive node references on this node (string-valued entries).
    pub fn node_ref_inputs(&self) -> BTreeMap<String, InputRef> {
        self.inputs
            .iter()
            .flatten()
            .filter(|(_, reference)| matches!(reference, InputRef::Node(_)))
            .map(|(name, reference)| (name.clone(), reference.clone()))
            .collect()
    }
}

/// The full persisted lock state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDocument {
    pub nodes: BTreeMap<String, LockNode>,

    #[serde(default = "default_root")]
    pub root: String,

    #[serde(default = "default_lock_version")]
    pub version: u32,
}

fn default_lock_version() -> u32 {
    LOCK_FORMAT_VERSION
}

impl LockDocument {
    /// The canonical empty document: a root node with no inputs.
    pub fn empty() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_NODE.to_string(), LockNode::root());
        Self {
            nodes,
            root: ROOT_NODE.to_string(),
            version: LOCK_FORMAT_VERSION,
        }
    }

    /// The root node's `inputs` table (empty when absent).
    pub fn root_inputs(&self) -> BTreeMap<String, InputRef> {
        self.nodes
            .get(&self.root)
            .and_then(|node| node.inputs.clone())
            .unwrap_or_default()
    }
}

/// Read a lock document from disk.
///
/// Never fails: a missing file and a malformed one both yield the canonical
/// empty document, so callers always start from a usable state. A version
/// other than 7 is read anyway with a warning.
pub fn load(path: &Path) -> LockDocument {
    let Ok(text) = std::fs::read_to_string(path) else {
        return LockDocument::empty();
    };
    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return LockDocument::empty();
    };
    if let Some(version) = value.get("version").and_then(Value::as_u64) {
        if version != u64::from(LOCK_FORMAT_VERSION) {
            warn!("flake.lock version {version} may not be fully supported (expected {LOCK_FORMAT_VERSION})");
        }
    }
    serde_json::from_value(value).unwrap_or_else(|_| LockDocument::empty())
}

/// Write a lock document atomically (temp file + rename, no partial-file
/// visibility). Callers are expected to have checked [`documents_equal`]
/// first so an unchanged file keeps its modification time.
pub fn save(path: &Path, document: &LockDocument) -> Result<(), LockError> {
    let text = to_canonical_string(document)?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut file = tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))
        .map_err(|e| LockError::Write {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    file.write_all(text.as_bytes()).map_err(|e| LockError::Write {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    file.persist(path).map_err(|e| LockError::Write {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(())
}

/// Canonical serialized form: nulls stripped, keys sorted, two-space
/// indentation, exactly one trailing newline.
pub fn to_canonical_string(document: &LockDocument) -> Result<String, LockError> {
    let value = to_canonical_value(document)?;
    let mut text = serde_json::to_string_pretty(&value)?;
    text.push('\n');
    Ok(text)
}

/// Content equality over canonical JSON; this, not struct identity,
/// governs "did anything change".
pub fn documents_equal(a: &LockDocument, b: &LockDocument) -> bool {
    match (to_canonical_value(a), to_canonical_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn to_canonical_value(document: &LockDocument) -> Result<Value, LockError> {
    let mut value = serde_json::to_value(document)?;
    strip_nulls(&mut value);
    Ok(value)
}

/// Recursively remove null-valued keys. Native nix rejects lock files
/// containing null anywhere in the tree.
fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            for v in map.values_mut() {
                strip_nulls(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_nulls(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_shape() {
        let text = to_canonical_string(&LockDocument::empty()).unwrap();
        let expected = "{\n  \"nodes\": {\n    \"root\": {\n      \"inputs\": {}\n    }\n  },\n  \"root\": \"root\",\n  \"version\": 7\n}\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_flake_false_round_trip() {
        let node = LockNode {
            locked: Some(SourceInfo {
                kind: "github".into(),
                owner: Some("o".into()),
                repo: Some("r".into()),
                rev: Some("abc".into()),
                ..SourceInfo::default()
            }),
            original: Some(SourceInfo {
                kind: "github".into(),
                owner: Some("o".into()),
                repo: Some("r".into()),
                ..SourceInfo::default()
            }),
            flake: false,
            inputs: None,
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json.get("flake"), Some(&Value::Bool(false)));

        let back: LockNode = serde_json::from_value(json).unwrap();
        assert!(!back.flake);
    }

    #[test]
    fn test_flake_true_is_omitted() {
        let json = serde_json::to_value(LockNode::default()).unwrap();
        assert!(json.get("flake").is_none());

        // Absent on read means true
        let back: LockNode = serde_json::from_str("{}").unwrap();
        assert!(back.flake);
    }

    #[test]
    fn test_input_ref_untagged() {
        let node: InputRef = serde_json::from_str("\"nixpkgs\"").unwrap();
        assert_eq!(node, InputRef::Node("nixpkgs".into()));

        let follows: InputRef = serde_json::from_str("[\"a\", \"b\"]").unwrap();
        assert_eq!(follows, InputRef::Follows(vec!["a".into(), "b".into()]));

        assert_eq!(serde_json::to_string(&node).unwrap(), "\"nixpkgs\"");
        assert_eq!(serde_json::to_string(&follows).unwrap(), "[\"a\",\"b\"]");
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let doc = load(&dir.path().join("flake.lock"));
        assert!(documents_equal(&doc, &LockDocument::empty()));
    }

    #[test]
    fn test_load_corrupt_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flake.lock");
        std::fs::write(&path, "{not json").unwrap();
        let doc = load(&path);
        assert!(documents_equal(&doc, &LockDocument::empty()));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flake.lock");
        let mut doc = LockDocument::empty();
        doc.nodes.insert(
            "nixpkgs".into(),
            LockNode {
                locked: Some(SourceInfo {
                    kind: "github".into(),
                    owner: Some("NixOS".into()),
                    repo: Some("nixpkgs".into()),
                    rev: Some("abc".into()),
                    nar_hash: Some("sha256-xxx".into()),
                    ..SourceInfo::default()
                }),
                original: Some(SourceInfo {
                    kind: "github".into(),
                    owner: Some("NixOS".into()),
                    repo: Some("nixpkgs".into()),
                    ..SourceInfo::default()
                }),
                ..LockNode::default()
            },
        );

        save(&path, &doc).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("}\n"));
        assert!(!text.contains("null"));

        let back = load(&path);
        assert!(documents_equal(&doc, &back));
    }

    #[test]
    fn test_extra_fields_preserved() {
        let raw = r#"{
            "locked": {
                "type": "mercurial",
                "url": "https://example.com/hg",
                "changeset": "0123abcd"
            },
            "original": {"type": "mercurial", "url": "https://example.com/hg"}
        }"#;
        let node: LockNode = serde_json::from_str(raw).unwrap();
        let locked = node.locked.as_ref().unwrap();
        assert_eq!(locked.kind, "mercurial");
        assert_eq!(
            locked.extra.get("changeset").and_then(Value::as_str),
            Some("0123abcd")
        );
        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(
            back.pointer("/locked/changeset").and_then(Value::as_str),
            Some("0123abcd")
        );
    }
}
