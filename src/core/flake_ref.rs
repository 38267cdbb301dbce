//! Flake reference parsing
//!
//! Parses flake location strings (`github:owner/repo/ref`,
//! `git+https://...`, `path:./x`, bare filesystem paths) into a structured
//! form. Parsing is total: unrecognized schemes become
//! [`FlakeRef::Unknown`] with the raw string preserved, and the caller
//! decides whether that is an error or a passthrough.

use std::collections::BTreeMap;
use std::fmt;

/// A parsed, unresolved flake source reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlakeRef {
    /// `github:owner/repo[/ref][?ref=..&rev=..]`
    GitHub {
        owner: String,
        repo: String,
        ref_name: Option<String>,
        rev: Option<String>,
    },

    /// `git+<url>[?ref=..&rev=..]`
    Git {
        url: String,
        ref_name: Option<String>,
        rev: Option<String>,
    },

    /// `path:<dir>` or a bare filesystem path (`/`, `./`, `../`, `~`)
    Path { path: String },

    /// Anything else, preserved verbatim
    Unknown { url: String },
}

impl FlakeRef {
    /// Parse a flake reference string. Never fails.
    pub fn parse(input: &str) -> FlakeRef {
        let (base, params) = split_query(input);

        if let Some(rest) = base.strip_prefix("github:") {
            let mut parts = rest.splitn(3, '/');
            let owner = parts.next().unwrap_or_default().to_string();
            let repo = parts.next().unwrap_or_default().to_string();
            // An optional third path segment is a ref shorthand; query
            // parameters override it.
            let mut ref_name = parts.next().map(str::to_string);
            if let Some(r) = params.get("ref") {
                ref_name = Some(r.clone());
            }
            let rev = params.get("rev").cloned();
            return FlakeRef::GitHub {
                owner,
                repo,
                ref_name,
                rev,
            };
        }

        if let Some(url) = base.strip_prefix("git+") {
            return FlakeRef::Git {
                url: url.to_string(),
                ref_name: params.get("ref").cloned(),
                rev: params.get("rev").cloned(),
            };
        }

        if let Some(path) = base.strip_prefix("path:") {
            return FlakeRef::Path {
                path: path.to_string(),
            };
        }

        if base.starts_with('/')
            || base.starts_with("./")
            || base.starts_with("../")
            || base.starts_with('~')
        {
            return FlakeRef::Path {
                path: base.to_string(),
            };
        }

        FlakeRef::Unknown {
            url: input.to_string(),
        }
    }
}

impl fmt::Display for FlakeRef {
    /// Canonical reference string, suitable for handing to the fetch
    /// gateway. A pinned revision wins over a ref name: a specific commit
    /// is more precise than a branch.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlakeRef::GitHub {
                owner,
                repo,
                ref_name,
                rev,
            } => {
                write!(f, "github:{owner}/{repo}")?;
                if let Some(rev) = rev {
                    write!(f, "?rev={rev}")
                } else if let Some(ref_name) = ref_name {
                    write!(f, "/{ref_name}")
                } else {
                    Ok(())
                }
            }
            FlakeRef::Git { url, ref_name, rev } => {
                write!(f, "git+{url}")?;
                if let Some(rev) = rev {
                    write!(f, "?rev={rev}")
                } else if let Some(ref_name) = ref_name {
                    write!(f, "?ref={ref_name}")
                } else {
                    Ok(())
                }
            }
            FlakeRef::Path { path } => write!(f, "path:{path}"),
            FlakeRef::Unknown { url } => write!(f, "{url}"),
        }
    }
}

/// Split an optional `?key=value&...` suffix into a parameter map.
fn split_query(input: &str) -> (&str, BTreeMap<String, String>) {
    match input.split_once('?') {
        Some((base, query)) => {
            let mut params = BTreeMap::new();
            for pair in query.split('&') {
                if let Some((key, value)) = pair.split_once('=') {
                    params.insert(key.to_string(), value.to_string());
                }
            }
            (base, params)
        }
        None => (input, BTreeMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_github_basic() {
        assert_eq!(
            FlakeRef::parse("github:NixOS/nixpkgs"),
            FlakeRef::GitHub {
                owner: "NixOS".into(),
                repo: "nixpkgs".into(),
                ref_name: None,
                rev: None,
            }
        );
    }

    #[test]
    fn test_parse_github_ref_shorthand() {
        assert_eq!(
            FlakeRef::parse("github:NixOS/nixpkgs/nixos-unstable"),
            FlakeRef::GitHub {
                owner: "NixOS".into(),
                repo: "nixpkgs".into(),
                ref_name: Some("nixos-unstable".into()),
                rev: None,
            }
        );
    }

    #[test]
    fn test_parse_github_query_overrides_shorthand() {
        assert_eq!(
            FlakeRef::parse("github:NixOS/nixpkgs/master?ref=nixos-unstable"),
            FlakeRef::GitHub {
                owner: "NixOS".into(),
                repo: "nixpkgs".into(),
                ref_name: Some("nixos-unstable".into()),
                rev: None,
            }
        );
    }

    #[test]
    fn test_parse_github_rev() {
        let parsed = FlakeRef::parse("github:NixOS/nixpkgs?rev=abc123");
        assert_eq!(
            parsed,
            FlakeRef::GitHub {
                owner: "NixOS".into(),
                repo: "nixpkgs".into(),
                ref_name: None,
                rev: Some("abc123".into()),
            }
        );
        // rev wins over ref in the canonical form
        assert_eq!(parsed.to_string(), "github:NixOS/nixpkgs?rev=abc123");
    }

    #[test]
    fn test_parse_git() {
        assert_eq!(
            FlakeRef::parse("git+https://example.com/repo.git?ref=main"),
            FlakeRef::Git {
                url: "https://example.com/repo.git".into(),
                ref_name: Some("main".into()),
                rev: None,
            }
        );
    }

    #[test]
    fn test_parse_path_scheme() {
        assert_eq!(
            FlakeRef::parse("path:./local"),
            FlakeRef::Path {
                path: "./local".into()
            }
        );
    }

    #[test]
    fn test_parse_bare_paths() {
        for raw in ["/abs/dir", "./rel", "../up", "~/home"] {
            assert_eq!(
                FlakeRef::parse(raw),
                FlakeRef::Path { path: raw.into() },
                "{raw}"
            );
        }
    }

    #[test]
    fn test_parse_unknown_preserves_input() {
        assert_eq!(
            FlakeRef::parse("hg+https://example.com/repo?ref=tip"),
            FlakeRef::Unknown {
                url: "hg+https://example.com/repo?ref=tip".into()
            }
        );
    }

    #[test]
    fn test_display_github_ref() {
        let parsed = FlakeRef::parse("github:NixOS/nixpkgs/nixos-24.05");
        assert_eq!(parsed.to_string(), "github:NixOS/nixpkgs/nixos-24.05");
    }

    proptest! {
        /// Parsing is total: any input produces some reference.
        #[test]
        fn parse_never_panics(input in ".{0,120}") {
            let _ = FlakeRef::parse(&input);
        }

        /// Canonical github references survive a parse round trip.
        #[test]
        fn github_round_trip(
            owner in "[A-Za-z][A-Za-z0-9-]{0,12}",
            repo in "[A-Za-z][A-Za-z0-9-]{0,12}",
        ) {
            let reference = format!("github:{owner}/{repo}");
            let parsed = FlakeRef::parse(&reference);
            prop_assert_eq!(parsed.to_string(), reference);
        }
    }
}
