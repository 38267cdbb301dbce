//! CLI implementation for `renix develop`
//!
//! Enters the flake's development shell through nix-shell. The default
//! attribute category is `devShells`, so `renix develop` lands in
//! `devShells.<system>.default`.

use anyhow::Result;

use crate::core::installable::{self, FlakeLocation, Installable};
use crate::core::registry::Registry;
use crate::infra::nix::NixEnv;

use super::blocking;
use super::flake::{ensure_lock, require_flake};

/// Execute the develop command
pub async fn execute(installable: &str, command: Option<String>) -> Result<()> {
    let registry = Registry::from_env();
    let resolved = Installable::resolve(installable, &registry).await?;
    let status = match resolved.location {
        FlakeLocation::Remote(reference) => {
            let mut args = vec![
                "develop".to_string(),
                format!("{reference}#{}", resolved.attr),
            ];
            if let Some(run) = command {
                args.push("-c".to_string());
                args.push(run);
            }
            blocking(move || {
                let env = NixEnv::new()?;
                Ok(env.flake_passthrough(&args)?)
            })
            .await?
        }
        FlakeLocation::Local(dir) => {
            let attr = resolved.attr;
            blocking(move || {
                require_flake(&dir)?;
                let env = NixEnv::new()?;
                ensure_lock(&env, &dir)?;
                let attr = installable::resolve_attr_path(&attr, "devShells", env.system());
                Ok(env.shell(&dir, &attr, command.as_deref())?)
            })
            .await?
        }
    };
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
