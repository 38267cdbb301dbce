//! Transitive dependency collection
//!
//! A locked input's own flake.lock may declare further inputs. This module
//! reads that upstream lock (through the fetch gateway) and merges every
//! dependency not already present into the node map being built. The node
//! map doubles as the cycle check: a name already present is never fetched
//! again, so each node appears at most once no matter how many paths
//! reference it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::core::gateway::FetchGateway;
use crate::core::lock::{InputRef, LockDocument, LockNode, SourceInfo};
use crate::core::sync::{AddedEntry, ChangeSet};

/// How to obtain an input's source tree from its locked coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceArchive {
    /// Local directory; `flake.lock` is read straight off the filesystem
    Path(PathBuf),

    /// Clone at a pinned revision
    Git {
        url: String,
        rev: String,
        ref_name: Option<String>,
        nar_hash: String,
    },

    /// Archive download verified against the NAR hash
    Tarball { url: String, nar_hash: String },
}

/// Reconstruct the retrieval method for a locked source.
///
/// Returns `None` for kinds with no known retrieval method (mercurial and
/// anything unrecognized); callers skip that branch of the closure.
pub fn source_archive(locked: &SourceInfo) -> Option<SourceArchive> {
    let nar_hash = locked.nar_hash.clone().unwrap_or_default();
    match locked.kind.as_str() {
        "path" => Some(SourceArchive::Path(PathBuf::from(locked.path.as_deref()?))),
        "git" => Some(SourceArchive::Git {
            url: locked.url.clone()?,
            rev: locked.rev.clone()?,
            ref_name: locked.ref_name.clone(),
            nar_hash,
        }),
        "github" => {
            let (owner, repo, rev) =
                (locked.owner.as_deref()?, locked.repo.as_deref()?, locked.rev.as_deref()?);
            Some(SourceArchive::Tarball {
                url: format!("https://github.com/{owner}/{repo}/archive/{rev}.tar.gz"),
                nar_hash,
            })
        }
        "gitlab" => {
            let host = locked.host.as_deref().unwrap_or("gitlab.com");
            let (owner, repo, rev) =
                (locked.owner.as_deref()?, locked.repo.as_deref()?, locked.rev.as_deref()?);
            Some(SourceArchive::Tarball {
                url: format!("https://{host}/{owner}/{repo}/-/archive/{rev}/{repo}-{rev}.tar.gz"),
                nar_hash,
            })
        }
        "sourcehut" => {
            let host = locked.host.as_deref().unwrap_or("git.sr.ht");
            let (owner, repo, rev) =
                (locked.owner.as_deref()?, locked.repo.as_deref()?, locked.rev.as_deref()?);
            Some(SourceArchive::Tarball {
                url: format!("https://{host}/~{owner}/{repo}/archive/{rev}.tar.gz"),
                nar_hash,
            })
        }
        "tarball" | "file" => Some(SourceArchive::Tarball {
            url: locked.url.clone()?,
            nar_hash,
        }),
        _ => None,
    }
}

/// Recursively merge the dependencies declared by `input_name`'s own lock
/// file into `nodes`, recording every newly discovered node in `changes`.
///
/// `input_name` must already be present in `nodes`. Failures below the top
/// level are never fatal: a fetch error, a missing upstream lock file, or
/// an unsupported source kind just means that branch of the closure is
/// skipped with a warning.
pub fn collect_closure(
    gateway: &dyn FetchGateway,
    nodes: &mut BTreeMap<String, LockNode>,
    changes: &mut ChangeSet,
    input_name: &str,
) {
    let Some(node) = nodes.get(input_name) else {
        return;
    };
    // Non-flake sources have no inputs of their own to discover
    if !node.flake {
        return;
    }
    let Some(locked) = node.locked.clone() else {
        return;
    };
    let Some(archive) = source_archive(&locked) else {
        warn!(
            "skipping transitive dependency collection for input '{input_name}': \
             source type '{}' is not supported",
            locked.kind
        );
        return;
    };

    let upstream = match gateway.fetch_lock(&archive) {
        Ok(Some(value)) => value,
        // No upstream lock file means no transitive deps on this branch
        Ok(None) => return,
        Err(err) => {
            warn!("skipping transitive dependencies of '{input_name}': {err}");
            return;
        }
    };
    let upstream: LockDocument = match serde_json::from_value(upstream) {
        Ok(document) => document,
        Err(err) => {
            warn!("ignoring malformed upstream lock for '{input_name}': {err}");
            return;
        }
    };

    for (nested_name, reference) in upstream.root_inputs() {
        // Resolve one hop only; deeper follows chains stay as references
        // for the lock consumer to walk.
        let target = match &reference {
            InputRef::Node(name) => name.clone(),
            InputRef::Follows(path) => {
                path.first().cloned().unwrap_or_else(|| nested_name.clone())
            }
        };

        // An explicit follows override on this node wins over whatever the
        // upstream lock declares for the same nested name.
        let overridden = nodes.get(input_name).is_some_and(|node| {
            matches!(
                node.inputs.as_ref().and_then(|inputs| inputs.get(&nested_name)),
                Some(InputRef::Follows(_))
            )
        });
        if overridden {
            continue;
        }

        if !nodes.contains_key(&target) {
            let Some(transitive) = upstream.nodes.get(&target) else {
                continue;
            };
            if let Some(locked) = &transitive.locked {
                if source_archive(locked).is_none() {
                    warn!(
                        "skipping transitive input '{target}' of '{input_name}': \
                         source type '{}' is not supported",
                        locked.kind
                    );
                    continue;
                }
            }

            if let Some(node) = nodes.get_mut(input_name) {
                node.inputs
                    .get_or_insert_with(BTreeMap::new)
                    .entry(nested_name.clone())
                    .or_insert_with(|| InputRef::Node(target.clone()));
            }

            debug!("adding transitive dependency '{target}'");
            nodes.insert(target.clone(), transitive.clone());
            changes
                .added
                .push((target.clone(), AddedEntry::Node(transitive.clone())));
            collect_closure(gateway, nodes, changes, &target);
        } else if let Some(node) = nodes.get_mut(input_name) {
            // Already collected via another path; just record the reference
            node.inputs
                .get_or_insert_with(BTreeMap::new)
                .entry(nested_name.clone())
                .or_insert_with(|| InputRef::Node(target.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github(owner: &str, repo: &str, rev: &str) -> SourceInfo {
        SourceInfo {
            kind: "github".into(),
            owner: Some(owner.into()),
            repo: Some(repo.into()),
            rev: Some(rev.into()),
            nar_hash: Some("sha256-aaa".into()),
            ..SourceInfo::default()
        }
    }

    #[test]
    fn test_github_archive_url() {
        let archive = source_archive(&github("NixOS", "nixpkgs", "abc")).unwrap();
        assert_eq!(
            archive,
            SourceArchive::Tarball {
                url: "https://github.com/NixOS/nixpkgs/archive/abc.tar.gz".into(),
                nar_hash: "sha256-aaa".into(),
            }
        );
    }

    #[test]
    fn test_gitlab_archive_url_default_host() {
        let mut locked = github("grp", "proj", "abc");
        locked.kind = "gitlab".into();
        let SourceArchive::Tarball { url, .. } = source_archive(&locked).unwrap() else {
            panic!("expected a tarball archive");
        };
        assert_eq!(
            url,
            "https://gitlab.com/grp/proj/-/archive/abc/proj-abc.tar.gz"
        );
    }

    #[test]
    fn test_sourcehut_archive_url() {
        let mut locked = github("user", "proj", "abc");
        locked.kind = "sourcehut".into();
        let SourceArchive::Tarball { url, .. } = source_archive(&locked).unwrap() else {
            panic!("expected a tarball archive");
        };
        assert_eq!(url, "https://git.sr.ht/~user/proj/archive/abc.tar.gz");
    }

    #[test]
    fn test_git_archive() {
        let locked = SourceInfo {
            kind: "git".into(),
            url: Some("https://example.com/repo.git".into()),
            rev: Some("abc".into()),
            nar_hash: Some("sha256-bbb".into()),
            ..SourceInfo::default()
        };
        assert_eq!(
            source_archive(&locked).unwrap(),
            SourceArchive::Git {
                url: "https://example.com/repo.git".into(),
                rev: "abc".into(),
                ref_name: None,
                nar_hash: "sha256-bbb".into(),
            }
        );
    }

    #[test]
    fn test_path_archive() {
        let locked = SourceInfo {
            kind: "path".into(),
            path: Some("/src/dep".into()),
            ..SourceInfo::default()
        };
        assert_eq!(
            source_archive(&locked).unwrap(),
            SourceArchive::Path(PathBuf::from("/src/dep"))
        );
    }

    #[test]
    fn test_mercurial_is_unsupported() {
        let locked = SourceInfo {
            kind: "mercurial".into(),
            url: Some("https://example.com/hg".into()),
            ..SourceInfo::default()
        };
        assert!(source_archive(&locked).is_none());

        let locked = SourceInfo {
            kind: "hg".into(),
            ..SourceInfo::default()
        };
        assert!(source_archive(&locked).is_none());
    }

    #[test]
    fn test_incomplete_coordinates_are_unsupported() {
        let locked = SourceInfo {
            kind: "github".into(),
            owner: Some("o".into()),
            // repo and rev missing
            ..SourceInfo::default()
        };
        assert!(source_archive(&locked).is_none());
    }
}
