//! CLI implementation for `renix build`
//!
//! Resolves the installable, brings the lock file in sync, and builds the
//! selected attribute with nix-build. Remote references are handed to
//! `nix build` directly.

use anyhow::Result;

use crate::core::installable::{self, FlakeLocation, Installable};
use crate::core::registry::Registry;
use crate::infra::nix::NixEnv;

use super::blocking;
use super::flake::{ensure_lock, require_flake};

/// Execute the build command
pub async fn execute(installable: &str, out_link: Option<String>, no_link: bool) -> Result<()> {
    let registry = Registry::from_env();
    let resolved = Installable::resolve(installable, &registry).await?;
    match resolved.location {
        FlakeLocation::Remote(reference) => {
            let mut args = vec![
                "build".to_string(),
                format!("{reference}#{}", resolved.attr),
            ];
            if no_link {
                args.push("--no-link".to_string());
            } else if let Some(link) = out_link {
                args.push("-o".to_string());
                args.push(link);
            }
            let status = blocking(move || {
                let env = NixEnv::new()?;
                Ok(env.flake_passthrough(&args)?)
            })
            .await?;
            if !status.success() {
                std::process::exit(status.code().unwrap_or(1));
            }
            Ok(())
        }
        FlakeLocation::Local(dir) => {
            let attr = resolved.attr;
            let paths = blocking(move || {
                require_flake(&dir)?;
                let env = NixEnv::new()?;
                ensure_lock(&env, &dir)?;
                let attr = installable::resolve_attr_path(&attr, "packages", env.system());
                let link = if no_link {
                    None
                } else {
                    Some(out_link.as_deref().unwrap_or("result"))
                };
                Ok(env.build(&dir, &attr, link)?)
            })
            .await?;
            for path in paths {
                println!("{path}");
            }
            Ok(())
        }
    }
}
