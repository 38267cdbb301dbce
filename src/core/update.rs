//! Override and update driver
//!
//! `flake update` refreshes locked inputs to their latest revisions and
//! `--override-input` pins an input to an explicit reference. An override
//! pins resolution, not declaration: the node's `original` table keeps
//! reflecting what flake.nix declares, so a later plain sync can tell the
//! override apart from a declaration change.

use std::path::Path;

use indexmap::IndexMap;
use tracing::warn;

use crate::config::defaults::{LOCK_FORMAT_VERSION, REV_DISPLAY_LEN};
use crate::core::closure::collect_closure;
use crate::core::flake_ref::FlakeRef;
use crate::core::gateway::{FetchGateway, PrefetchData};
use crate::core::inputs::{DeclaredInput, SourceSpec};
use crate::core::lock::{self, InputRef, LockDocument, LockNode, SourceInfo, ROOT_NODE};
use crate::core::sync::{self, AddedEntry, ChangeSet, SyncOutcome};
use crate::error::{GatewayError, LockError};

/// Result of an update run.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub document: LockDocument,
    pub changes: ChangeSet,

    /// `(name, old short rev, new short rev)` for inputs whose revision
    /// actually moved
    pub revisions: Vec<(String, String, String)>,

    /// Overridden inputs whose locked revision was already the requested
    /// one, with the short revision
    pub already_pinned: Vec<(String, String)>,
}

/// Outcome of [`update_to_path`], for reporting.
#[derive(Debug)]
pub struct UpdateReport {
    pub changes: ChangeSet,
    pub revisions: Vec<(String, String, String)>,
    pub already_pinned: Vec<(String, String)>,
    pub written: bool,
    pub created: bool,
}

/// Expand the override shorthand: a value with no `:` and no `/` is a
/// branch or tag name, completed against the input's declared coordinates.
/// Anything else is taken as a full flake reference.
pub fn expand_override(declared: Option<&SourceSpec>, value: &str) -> String {
    if value.contains(':') || value.contains('/') {
        return value.to_string();
    }
    match declared.map(|spec| &spec.reference) {
        Some(FlakeRef::GitHub { owner, repo, .. }) => {
            format!("github:{owner}/{repo}/{value}")
        }
        Some(FlakeRef::Git { url, .. }) => format!("git+{url}?ref={value}"),
        _ => value.to_string(),
    }
}

/// Refresh locked inputs, applying explicit override pins first.
///
/// `input_name` limits the refresh to one input; `overrides` pins inputs
/// to explicit references. With neither, every declared input is
/// re-resolved. When no usable previous lock exists, all declared inputs
/// are locked in a single pass with overrides applied where given.
pub fn update(
    gateway: &dyn FetchGateway,
    declared: &IndexMap<String, DeclaredInput>,
    old: &LockDocument,
    input_name: Option<&str>,
    overrides: &[(String, String)],
) -> Result<UpdateOutcome, LockError> {
    for (name, _) in overrides {
        if !declared.contains_key(name) {
            return Err(LockError::UnknownInput { name: name.clone() });
        }
    }
    if let Some(name) = input_name {
        if !declared.contains_key(name) {
            return Err(LockError::UnknownInput {
                name: name.to_string(),
            });
        }
    }

    if lock::documents_equal(old, &LockDocument::empty()) {
        return fresh_lock(gateway, declared, overrides);
    }

    let mut nodes = old.nodes.clone();
    let mut root_inputs = old.root_inputs();
    let mut changes = ChangeSet::default();
    let mut revisions = Vec::new();
    let mut already_pinned = Vec::new();

    for (name, value) in overrides {
        let spec = match declared.get(name) {
            Some(DeclaredInput::Source(spec)) => Some(spec),
            _ => None,
        };
        let reference = expand_override(spec, value);
        let node = lock_pinned(gateway, name, &reference, spec)?;
        let old_node = nodes.get(name).filter(|_| name != ROOT_NODE).cloned();
        let old_rev = short_rev(old_node.as_ref());
        let new_rev = short_rev(Some(&node));
        if old_rev == new_rev {
            already_pinned.push((name.clone(), new_rev));
        } else {
            revisions.push((name.clone(), old_rev, new_rev));
            match old_node {
                Some(old_node) => changes.updated.push((name.clone(), old_node, node.clone())),
                None => changes.added.push((name.clone(), AddedEntry::Node(node.clone()))),
            }
        }
        nodes.insert(name.clone(), node);
        root_inputs.insert(name.clone(), InputRef::Node(name.clone()));
        collect_closure(gateway, &mut nodes, &mut changes, name);
    }

    // Which inputs get re-resolved to latest; overridden ones are pinned
    // already and excluded.
    let overridden = |name: &str| overrides.iter().any(|(n, _)| n == name);
    let refresh: Vec<&String> = match input_name {
        Some(name) => declared
            .keys()
            .filter(|n| n.as_str() == name && !overridden(n))
            .collect(),
        None if overrides.is_empty() => declared.keys().collect(),
        // Overrides without an input name only apply the pins
        None => Vec::new(),
    };

    for name in refresh {
        match &declared[name] {
            DeclaredInput::Follows(path) => {
                root_inputs.insert(name.clone(), InputRef::Follows(path.clone()));
            }
            DeclaredInput::Source(spec) => {
                let Some(node) = sync::lock_input(gateway, name, spec)? else {
                    continue;
                };
                let old_node = nodes.get(name).filter(|_| name != ROOT_NODE).cloned();
                let old_rev = short_rev(old_node.as_ref());
                let new_rev = short_rev(Some(&node));
                if old_rev != new_rev {
                    revisions.push((name.clone(), old_rev, new_rev));
                    match old_node {
                        Some(old_node) => {
                            changes.updated.push((name.clone(), old_node, node.clone()));
                        }
                        None => changes
                            .added
                            .push((name.clone(), AddedEntry::Node(node.clone()))),
                    }
                }
                nodes.insert(name.clone(), node);
                root_inputs.insert(name.clone(), InputRef::Node(name.clone()));
                collect_closure(gateway, &mut nodes, &mut changes, name);
            }
        }
    }

    // A pins-only run leaves undeclared leftovers alone; a real update
    // prunes inputs that disappeared from flake.nix.
    if overrides.is_empty() || input_name.is_some() {
        let stale: Vec<String> = root_inputs
            .keys()
            .filter(|name| !declared.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            root_inputs.remove(&name);
            nodes.remove(&name);
            changes.removed.push(name);
        }
    }

    nodes.insert(
        ROOT_NODE.to_string(),
        LockNode {
            inputs: Some(root_inputs),
            ..LockNode::default()
        },
    );
    let document = LockDocument {
        nodes,
        root: ROOT_NODE.to_string(),
        version: LOCK_FORMAT_VERSION,
    };
    Ok(UpdateOutcome {
        document,
        changes,
        revisions,
        already_pinned,
    })
}

/// No previous lock: lock every declared input in one pass, substituting
/// override references where given.
fn fresh_lock(
    gateway: &dyn FetchGateway,
    declared: &IndexMap<String, DeclaredInput>,
    overrides: &[(String, String)],
) -> Result<UpdateOutcome, LockError> {
    if overrides.is_empty() {
        let SyncOutcome { document, changes } =
            sync::sync(gateway, declared, &LockDocument::empty())?;
        return Ok(UpdateOutcome {
            document,
            changes,
            revisions: Vec::new(),
            already_pinned: Vec::new(),
        });
    }

    // Overrides change which revision each pinned input resolves to, so
    // the plain engine is bypassed and every input is locked here.
    let mut nodes = std::collections::BTreeMap::new();
    let mut root_inputs = std::collections::BTreeMap::new();
    let mut changes = ChangeSet::default();

    for (name, input) in declared {
        let pin = overrides
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value);
        match (input, pin) {
            (DeclaredInput::Follows(path), _) => {
                root_inputs.insert(name.clone(), InputRef::Follows(path.clone()));
                changes
                    .added
                    .push((name.clone(), AddedEntry::Follows(path.clone())));
            }
            (DeclaredInput::Source(spec), Some(value)) => {
                let reference = expand_override(Some(spec), value);
                let node = lock_pinned(gateway, name, &reference, Some(spec))?;
                nodes.insert(name.clone(), node.clone());
                root_inputs.insert(name.clone(), InputRef::Node(name.clone()));
                changes.added.push((name.clone(), AddedEntry::Node(node)));
                collect_closure(gateway, &mut nodes, &mut changes, name);
            }
            (DeclaredInput::Source(spec), None) => {
                if let Some(node) = sync::lock_input(gateway, name, spec)? {
                    nodes.insert(name.clone(), node.clone());
                    root_inputs.insert(name.clone(), InputRef::Node(name.clone()));
                    changes.added.push((name.clone(), AddedEntry::Node(node)));
                    collect_closure(gateway, &mut nodes, &mut changes, name);
                }
            }
        }
    }

    nodes.insert(
        ROOT_NODE.to_string(),
        LockNode {
            inputs: Some(root_inputs),
            ..LockNode::default()
        },
    );
    Ok(UpdateOutcome {
        document: LockDocument {
            nodes,
            root: ROOT_NODE.to_string(),
            version: LOCK_FORMAT_VERSION,
        },
        changes,
        revisions: Vec::new(),
        already_pinned: Vec::new(),
    })
}

/// Lock one input to an explicit reference.
///
/// Only github and git references can be pinned. The `original` table is
/// built from the declared spec when its kind matches the pin; otherwise
/// the gateway's parse of the pin itself is used.
fn lock_pinned(
    gateway: &dyn FetchGateway,
    name: &str,
    reference: &str,
    declared: Option<&SourceSpec>,
) -> Result<LockNode, LockError> {
    let parsed = FlakeRef::parse(reference);
    let fetch = |reference: &str| -> Result<PrefetchData, LockError> {
        gateway
            .prefetch(reference)
            .map_err(|err: GatewayError| LockError::InputFetch {
                name: name.to_string(),
                reference: reference.to_string(),
                message: err.to_string(),
            })
    };

    match &parsed {
        FlakeRef::GitHub { owner, repo, .. } => {
            let data = fetch(reference)?;
            let rev = data
                .locked
                .rev
                .clone()
                .ok_or_else(|| LockError::InputFetch {
                    name: name.to_string(),
                    reference: reference.to_string(),
                    message: "prefetch result carries no revision".to_string(),
                })?;
            let locked = SourceInfo {
                kind: "github".into(),
                owner: data.locked.owner.clone().or_else(|| Some(owner.clone())),
                repo: data.locked.repo.clone().or_else(|| Some(repo.clone())),
                rev: Some(rev),
                nar_hash: Some(data.hash.clone()),
                last_modified: data.locked.last_modified,
                ..SourceInfo::default()
            };
            let original = pinned_original(&parsed, declared, &data);
            Ok(build_node(locked, original, declared))
        }
        FlakeRef::Git { url, .. } => {
            let data = fetch(reference)?;
            let rev = data
                .locked
                .rev
                .clone()
                .ok_or_else(|| LockError::InputFetch {
                    name: name.to_string(),
                    reference: reference.to_string(),
                    message: "prefetch result carries no revision".to_string(),
                })?;
            let locked = SourceInfo {
                kind: "git".into(),
                url: data.locked.url.clone().or_else(|| Some(url.clone())),
                rev: Some(rev),
                rev_count: data.locked.rev_count,
                nar_hash: Some(data.hash.clone()),
                last_modified: data.locked.last_modified,
                ..SourceInfo::default()
            };
            let original = pinned_original(&parsed, declared, &data);
            Ok(build_node(locked, original, declared))
        }
        FlakeRef::Path { .. } => Err(LockError::UnsupportedOverride {
            name: name.to_string(),
            kind: "path".to_string(),
        }),
        FlakeRef::Unknown { url } => Err(LockError::UnsupportedOverride {
            name: name.to_string(),
            kind: url.clone(),
        }),
    }
}

/// `original` coordinates for a pinned input: the declaration when its
/// kind matches, else the gateway's own parse of the pin.
fn pinned_original(
    pin: &FlakeRef,
    declared: Option<&SourceSpec>,
    data: &PrefetchData,
) -> SourceInfo {
    match (pin, declared.map(|spec| &spec.reference)) {
        (FlakeRef::GitHub { .. }, Some(FlakeRef::GitHub { owner, repo, ref_name, .. })) => {
            SourceInfo {
                kind: "github".into(),
                owner: Some(owner.clone()),
                repo: Some(repo.clone()),
                ref_name: ref_name.clone(),
                ..SourceInfo::default()
            }
        }
        (FlakeRef::Git { .. }, Some(FlakeRef::Git { url, ref_name, .. })) => SourceInfo {
            kind: "git".into(),
            url: Some(url.clone()),
            ref_name: ref_name.clone(),
            ..SourceInfo::default()
        },
        _ => {
            let mut original = data.original.clone();
            if original.kind.is_empty() {
                original.kind = match pin {
                    FlakeRef::GitHub { .. } => "github".into(),
                    FlakeRef::Git { .. } => "git".into(),
                    FlakeRef::Path { .. } => "path".into(),
                    FlakeRef::Unknown { .. } => original.kind,
                };
            }
            original
        }
    }
}

/// Attach the declared flake-ness and nested follows, like a plain lock
/// would; pinning changes the revision, not the node's shape.
fn build_node(locked: SourceInfo, original: SourceInfo, declared: Option<&SourceSpec>) -> LockNode {
    match declared {
        Some(spec) => sync::node_from(locked, original, spec),
        None => LockNode {
            locked: Some(locked),
            original: Some(original),
            ..LockNode::default()
        },
    }
}

/// Short display form of a node's locked revision.
fn short_rev(node: Option<&LockNode>) -> String {
    node.and_then(|node| node.locked.as_ref())
        .and_then(|locked| locked.rev.as_deref())
        .map(|rev| rev.chars().take(REV_DISPLAY_LEN).collect())
        .unwrap_or_default()
}

/// Load, update, and (when changed) persist the lock at `lock_path`.
pub fn update_to_path(
    gateway: &dyn FetchGateway,
    declared: &IndexMap<String, DeclaredInput>,
    lock_path: &Path,
    input_name: Option<&str>,
    overrides: &[(String, String)],
) -> Result<UpdateReport, LockError> {
    if !lock_path.exists() && overrides.is_empty() && input_name.is_none() {
        let report = sync::sync_to_path(gateway, declared, lock_path)?;
        return Ok(UpdateReport {
            changes: report.changes,
            revisions: Vec::new(),
            already_pinned: Vec::new(),
            written: report.written,
            created: report.created,
        });
    }

    let created = !lock_path.exists();
    let old = lock::load(lock_path);
    let outcome = update(gateway, declared, &old, input_name, overrides)?;
    let written = !lock::documents_equal(&old, &outcome.document);
    if written {
        lock::save(lock_path, &outcome.document)?;
    } else if !outcome.already_pinned.is_empty() {
        warn!("lock file unchanged");
    }
    Ok(UpdateReport {
        changes: outcome.changes,
        revisions: outcome.revisions,
        already_pinned: outcome.already_pinned,
        written,
        created,
    })
}
