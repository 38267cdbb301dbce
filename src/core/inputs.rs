//! Declared flake inputs
//!
//! Models the `inputs` attribute of flake.nix as extracted by the
//! evaluator. Declared inputs are rebuilt fresh on every synchronization
//! run and never persisted; only their resolved counterparts land in the
//! lock document.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::core::flake_ref::FlakeRef;

fn default_true() -> bool {
    true
}

/// Raw per-input record returned by the flake.nix evaluation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInput {
    pub name: String,

    /// Source URL; a bare string input is reported as a url-only record
    #[serde(default)]
    pub url: Option<String>,

    /// Root-level follows target (`inputs.<name>.follows = "a/b"`)
    #[serde(default)]
    pub follows: Option<String>,

    #[serde(default = "default_true")]
    pub flake: bool,

    /// Nested follows (`inputs.<name>.inputs.<x>.follows`)
    #[serde(default, rename = "nestedFollows")]
    pub nested_follows: BTreeMap<String, String>,
}

/// A declared input after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclaredInput {
    /// A pointer at another input; never fetched, never gets a node
    Follows(Vec<String>),

    /// A fetchable source declaration
    Source(SourceSpec),
}

/// A declared source input.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub reference: FlakeRef,
    pub is_flake: bool,

    /// Nested follows overrides keyed by the nested input name
    pub follows: BTreeMap<String, Vec<String>>,
}

impl SourceSpec {
    /// A plain spec for a reference, no overrides.
    pub fn from_ref(reference: FlakeRef) -> Self {
        Self {
            reference,
            is_flake: true,
            follows: BTreeMap::new(),
        }
    }
}

/// Split a follows target into path segments (`"a/b"` -> `["a", "b"]`).
pub fn follows_path(raw: &str) -> Vec<String> {
    raw.split('/').map(str::to_string).collect()
}

/// Convert raw evaluation records into the declared-input map,
/// preserving declaration order.
pub fn parse_inputs(raw: Vec<RawInput>) -> IndexMap<String, DeclaredInput> {
    let mut parsed = IndexMap::new();
    for input in raw {
        if let Some(target) = input.follows {
            parsed.insert(input.name, DeclaredInput::Follows(follows_path(&target)));
            continue;
        }
        let Some(url) = input.url else {
            continue;
        };
        let follows = input
            .nested_follows
            .iter()
            .map(|(name, target)| (name.clone(), follows_path(target)))
            .collect();
        parsed.insert(
            input.name,
            DeclaredInput::Source(SourceSpec {
                reference: FlakeRef::parse(&url),
                is_flake: input.flake,
                follows,
            }),
        );
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str) -> RawInput {
        RawInput {
            name: name.into(),
            url: None,
            follows: None,
            flake: true,
            nested_follows: BTreeMap::new(),
        }
    }

    #[test]
    fn test_parse_url_input() {
        let inputs = parse_inputs(vec![RawInput {
            url: Some("github:NixOS/nixpkgs".into()),
            ..raw("nixpkgs")
        }]);
        match &inputs["nixpkgs"] {
            DeclaredInput::Source(spec) => {
                assert!(spec.is_flake);
                assert!(spec.follows.is_empty());
                assert_eq!(spec.reference.to_string(), "github:NixOS/nixpkgs");
            }
            DeclaredInput::Follows(_) => panic!("expected a source input"),
        }
    }

    #[test]
    fn test_parse_follows_input() {
        let inputs = parse_inputs(vec![RawInput {
            follows: Some("nixpkgs".into()),
            ..raw("pkgs")
        }]);
        assert_eq!(
            inputs["pkgs"],
            DeclaredInput::Follows(vec!["nixpkgs".into()])
        );
    }

    #[test]
    fn test_parse_follows_multi_segment() {
        assert_eq!(follows_path("parent/nixpkgs"), vec!["parent", "nixpkgs"]);
        assert_eq!(follows_path("nixpkgs"), vec!["nixpkgs"]);
    }

    #[test]
    fn test_parse_nested_follows() {
        let mut nested = BTreeMap::new();
        nested.insert("nixpkgs".to_string(), "nixpkgs".to_string());
        let inputs = parse_inputs(vec![RawInput {
            url: Some("github:o/utils".into()),
            nested_follows: nested,
            ..raw("utils")
        }]);
        match &inputs["utils"] {
            DeclaredInput::Source(spec) => {
                assert_eq!(spec.follows["nixpkgs"], vec!["nixpkgs".to_string()]);
            }
            DeclaredInput::Follows(_) => panic!("expected a source input"),
        }
    }

    #[test]
    fn test_inputs_without_url_or_follows_are_dropped() {
        let inputs = parse_inputs(vec![raw("broken")]);
        assert!(inputs.is_empty());
    }

    #[test]
    fn test_declaration_order_preserved() {
        let inputs = parse_inputs(vec![
            RawInput {
                url: Some("github:o/zlib".into()),
                ..raw("zlib")
            },
            RawInput {
                url: Some("github:o/abc".into()),
                ..raw("abc")
            },
        ]);
        let names: Vec<&String> = inputs.keys().collect();
        assert_eq!(names, ["zlib", "abc"]);
    }
}
