//! Lock synchronization engine
//!
//! Reconciles the inputs declared in flake.nix against the previous lock
//! document: new inputs are resolved through the fetch gateway, unchanged
//! inputs are carried forward without any network traffic, follows and
//! flake-ness changes are applied surgically, and inputs that disappeared
//! from the declaration are dropped. The produced document is only
//! persisted when its canonical form actually differs from the old one, so
//! a no-op sync never touches the file's modification time.

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::core::closure::collect_closure;
use crate::core::flake_ref::FlakeRef;
use crate::core::gateway::{FetchGateway, PrefetchData};
use crate::core::inputs::{DeclaredInput, SourceSpec};
use crate::config::defaults::LOCK_FORMAT_VERSION;
use crate::core::lock::{self, InputRef, LockDocument, LockNode, SourceInfo, ROOT_NODE};
use crate::error::LockError;

/// One entry in a change-set's `added` list.
#[derive(Debug, Clone, PartialEq)]
pub enum AddedEntry {
    /// A resolved node
    Node(LockNode),

    /// A root-level follows declaration; no node exists for it
    Follows(Vec<String>),
}

/// Ephemeral record of what one synchronization run changed, in discovery
/// order. Used only for reporting; never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub added: Vec<(String, AddedEntry)>,
    pub updated: Vec<(String, LockNode, LockNode)>,
    pub removed: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Result of a synchronization run.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub document: LockDocument,
    pub changes: ChangeSet,
}

/// Outcome of [`sync_to_path`], for reporting.
#[derive(Debug)]
pub struct SyncReport {
    pub changes: ChangeSet,
    /// Whether the lock file was (re)written
    pub written: bool,
    /// Whether no lock file existed before this run
    pub created: bool,
}

/// Reconcile declared inputs against the previous lock document.
///
/// Each declared input lands in exactly one of five cases: a root-level
/// follows pointer, a full re-lock because flake-ness changed, a surgical
/// follows update, an untouched carry-forward, or a fresh resolution. Any
/// previously locked root input no longer declared is removed together
/// with its (uncarried) transitive subtree.
pub fn sync(
    gateway: &dyn FetchGateway,
    declared: &IndexMap<String, DeclaredInput>,
    old: &LockDocument,
) -> Result<SyncOutcome, LockError> {
    let old_root_inputs = old.root_inputs();
    let mut nodes: BTreeMap<String, LockNode> = BTreeMap::new();
    let mut root_inputs: BTreeMap<String, InputRef> = BTreeMap::new();
    let mut changes = ChangeSet::default();

    for (name, input) in declared {
        match input {
            DeclaredInput::Follows(path) => {
                // A follows declaration is purely a pointer; nothing is
                // fetched and no node is created. Report it as added the
                // first time it appears or whenever the target changed.
                let unchanged = matches!(
                    old_root_inputs.get(name),
                    Some(InputRef::Follows(existing)) if existing == path
                );
                root_inputs.insert(name.clone(), InputRef::Follows(path.clone()));
                if !unchanged {
                    changes
                        .added
                        .push((name.clone(), AddedEntry::Follows(path.clone())));
                }
            }
            DeclaredInput::Source(spec) => {
                let existing = old
                    .nodes
                    .get(name)
                    .filter(|_| name != ROOT_NODE)
                    .cloned();
                if let Some(existing) = existing {
                    sync_existing(
                        gateway,
                        old,
                        name,
                        spec,
                        &existing,
                        &mut nodes,
                        &mut root_inputs,
                        &mut changes,
                    )?;
                } else if let Some(node) = lock_input(gateway, name, spec)? {
                    nodes.insert(name.clone(), node.clone());
                    root_inputs.insert(name.clone(), InputRef::Node(name.clone()));
                    changes.added.push((name.clone(), AddedEntry::Node(node)));
                    collect_closure(gateway, &mut nodes, &mut changes, name);
                }
            }
        }
    }

    // Anything locked at the root before but not declared anymore is a
    // removal; its nodes were simply never carried over.
    for name in old_root_inputs.keys() {
        if !root_inputs.contains_key(name) {
            changes.removed.push(name.clone());
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
    Ok(SyncOutcome { document, changes })
}

/// Handle a declared input that already has a locked node.
#[allow(clippy::too_many_arguments)]
fn sync_existing(
    gateway: &dyn FetchGateway,
    old: &LockDocument,
    name: &str,
    spec: &SourceSpec,
    existing: &LockNode,
    nodes: &mut BTreeMap<String, LockNode>,
    root_inputs: &mut BTreeMap<String, InputRef>,
    changes: &mut ChangeSet,
) -> Result<(), LockError> {
    // Flake-ness changed: whether transitive deps are even sought depends
    // on it, so the input is re-locked from scratch.
    if spec.is_flake != existing.flake {
        debug!("re-locking '{name}': flake attribute changed");
        if let Some(node) = lock_input(gateway, name, spec)? {
            nodes.insert(name.to_string(), node.clone());
            root_inputs.insert(name.to_string(), InputRef::Node(name.to_string()));
            changes.added.push((name.to_string(), AddedEntry::Node(node)));
            collect_closure(gateway, nodes, changes, name);
        }
        return Ok(());
    }

    // Follows overrides changed: replace only the list-valued entries,
    // string-valued transitive references stay untouched.
    if existing.follows_inputs() != spec.follows {
        let mut inputs = existing.node_ref_inputs();
        for (nested, path) in &spec.follows {
            inputs.insert(nested.clone(), InputRef::Follows(path.clone()));
        }
        let updated = LockNode {
            inputs: if inputs.is_empty() { None } else { Some(inputs) },
            ..existing.clone()
        };
        nodes.insert(name.to_string(), updated.clone());
        root_inputs.insert(name.to_string(), InputRef::Node(name.to_string()));
        changes
            .updated
            .push((name.to_string(), existing.clone(), updated));
        // New follows can expose transitive deps that were previously
        // shadowed (or vice versa)
        collect_closure(gateway, nodes, changes, name);
        return Ok(());
    }

    // Unchanged: carry the node and its whole previously collected subtree
    // forward without touching the network.
    carry_subtree(old, nodes, name);
    root_inputs.insert(name.to_string(), InputRef::Node(name.to_string()));
    // Locks written before transitive collection existed may reference
    // nodes that were never recorded; collect them now.
    repair_missing_transitives(gateway, nodes, changes);
    Ok(())
}

/// Copy `name` and every node reachable from it out of the old document.
/// Transitive nodes live as top-level siblings, so this walks the `inputs`
/// graph rather than copying a single entry.
fn carry_subtree(old: &LockDocument, nodes: &mut BTreeMap<String, LockNode>, name: &str) {
    if name == ROOT_NODE || nodes.contains_key(name) {
        return;
    }
    let Some(node) = old.nodes.get(name) else {
        return;
    };
    nodes.insert(name.to_string(), node.clone());
    for reference in node.inputs.iter().flatten().map(|(_, r)| r) {
        match reference {
            InputRef::Node(target) => carry_subtree(old, nodes, target),
            InputRef::Follows(path) => {
                if let Some(head) = path.first() {
                    carry_subtree(old, nodes, head);
                }
            }
        }
    }
}

/// Trigger closure collection for any carried node that references a node
/// name that was never actually collected.
fn repair_missing_transitives(
    gateway: &dyn FetchGateway,
    nodes: &mut BTreeMap<String, LockNode>,
    changes: &mut ChangeSet,
) {
    let names: Vec<String> = nodes.keys().cloned().collect();
    for name in names {
        if name == ROOT_NODE {
            continue;
        }
        let missing = nodes.get(&name).is_some_and(|node| {
            node.inputs.iter().flatten().any(|(_, reference)| {
                matches!(reference, InputRef::Node(target) if !nodes.contains_key(target))
            })
        });
        if missing {
            debug!("collecting missing transitive dependencies of '{name}'");
            collect_closure(gateway, nodes, changes, &name);
        }
    }
}

/// Resolve one declared input via the gateway, producing a lock node.
///
/// The `original` table is built from the declared spec; the gateway's own
/// parse is only a fallback. Returns `Ok(None)` for unrecognized reference
/// kinds, which are skipped with a warning.
pub(crate) fn lock_input(
    gateway: &dyn FetchGateway,
    name: &str,
    spec: &SourceSpec,
) -> Result<Option<LockNode>, LockError> {
    let reference = spec.reference.to_string();
    match &spec.reference {
        FlakeRef::GitHub {
            owner,
            repo,
            ref_name,
            ..
        } => {
            debug!("locking {name} ({reference})");
            let data = prefetch(gateway, name, &reference)?;
            let rev = require_rev(&data, name, &reference)?;
            let locked = SourceInfo {
                kind: "github".into(),
                owner: data.locked.owner.clone().or_else(|| Some(owner.clone())),
                repo: data.locked.repo.clone().or_else(|| Some(repo.clone())),
                rev: Some(rev),
                nar_hash: Some(data.hash.clone()),
                last_modified: data.locked.last_modified,
                ..SourceInfo::default()
            };
            let original = SourceInfo {
                kind: "github".into(),
                owner: data.original.owner.clone().or_else(|| Some(owner.clone())),
                repo: data.original.repo.clone().or_else(|| Some(repo.clone())),
                ref_name: ref_name.clone().or_else(|| data.original.ref_name.clone()),
                ..SourceInfo::default()
            };
            Ok(Some(node_from(locked, original, spec)))
        }
        FlakeRef::Git { url, ref_name, .. } => {
            debug!("locking {name} ({reference})");
            let data = prefetch(gateway, name, &reference)?;
            let rev = require_rev(&data, name, &reference)?;
            let locked = SourceInfo {
                kind: "git".into(),
                url: data.locked.url.clone().or_else(|| Some(url.clone())),
                rev: Some(rev),
                rev_count: data.locked.rev_count,
                nar_hash: Some(data.hash.clone()),
                last_modified: data.locked.last_modified,
                ..SourceInfo::default()
            };
            let original = SourceInfo {
                kind: "git".into(),
                url: data.original.url.clone().or_else(|| Some(url.clone())),
                ref_name: ref_name.clone().or_else(|| data.original.ref_name.clone()),
                ..SourceInfo::default()
            };
            Ok(Some(node_from(locked, original, spec)))
        }
        FlakeRef::Path { path } => {
            debug!("locking {name} ({reference})");
            let original = SourceInfo {
                kind: "path".into(),
                path: Some(path.clone()),
                ..SourceInfo::default()
            };
            // Prefetch supplies narHash and lastModified; a local path is
            // still usable without them if prefetch fails.
            let locked = match gateway.prefetch(&reference) {
                Ok(data) => SourceInfo {
                    nar_hash: Some(data.hash.clone()),
                    last_modified: data.locked.last_modified,
                    ..original.clone()
                },
                Err(err) => {
                    warn!("prefetch of path input '{name}' failed: {err}");
                    original.clone()
                }
            };
            Ok(Some(node_from(locked, original, spec)))
        }
        FlakeRef::Unknown { url } => {
            warn!("skipping input '{name}' with unrecognized reference '{url}'");
            Ok(None)
        }
    }
}

/// Prefetch with errors mapped to the fatal input-fetch variant.
fn prefetch(
    gateway: &dyn FetchGateway,
    name: &str,
    reference: &str,
) -> Result<PrefetchData, LockError> {
    gateway
        .prefetch(reference)
        .map_err(|err| LockError::InputFetch {
            name: name.to_string(),
            reference: reference.to_string(),
            message: err.to_string(),
        })
}

fn require_rev(data: &PrefetchData, name: &str, reference: &str) -> Result<String, LockError> {
    data.locked
        .rev
        .clone()
        .ok_or_else(|| LockError::InputFetch {
            name: name.to_string(),
            reference: reference.to_string(),
            message: "prefetch result carries no revision".to_string(),
        })
}

/// Assemble a node from resolved coordinates plus the declared flake-ness
/// and nested follows overrides.
pub(crate) fn node_from(locked: SourceInfo, original: SourceInfo, spec: &SourceSpec) -> LockNode {
    let inputs = if spec.follows.is_empty() {
        None
    } else {
        Some(
            spec.follows
                .iter()
                .map(|(name, path)| (name.clone(), InputRef::Follows(path.clone())))
                .collect(),
        )
    };
    LockNode {
        locked: Some(locked),
        original: Some(original),
        flake: spec.is_flake,
        inputs,
    }
}

/// Load, reconcile, and (when changed) persist the lock for a flake
/// directory's lock path.
pub fn sync_to_path(
    gateway: &dyn FetchGateway,
    declared: &IndexMap<String, DeclaredInput>,
    lock_path: &Path,
) -> Result<SyncReport, LockError> {
    let created = !lock_path.exists();
    let old = lock::load(lock_path);
    let outcome = sync(gateway, declared, &old)?;
    let written = !lock::documents_equal(&old, &outcome.document);
    if written {
        lock::save(lock_path, &outcome.document)?;
    }
    Ok(SyncReport {
        changes: outcome.changes,
        written,
        created,
    })
}
