//! CLI implementation for `renix run`
//!
//! Builds the attribute without a result link, asks the derivation for
//! its main program, and executes it with the remaining arguments.

use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::core::installable::{self, FlakeLocation, Installable};
use crate::core::registry::Registry;
use crate::infra::nix::{EvalOptions, NixEnv};

use super::blocking;
use super::flake::{ensure_lock, require_flake};

/// Execute the run command
pub async fn execute(installable: &str, args: Vec<String>) -> Result<()> {
    let registry = Registry::from_env();
    let resolved = Installable::resolve(installable, &registry).await?;
    match resolved.location {
        FlakeLocation::Remote(reference) => {
            let mut pass = vec!["run".to_string(), format!("{reference}#{}", resolved.attr)];
            if !args.is_empty() {
                pass.push("--".to_string());
                pass.extend(args);
            }
            let status = blocking(move || {
                let env = NixEnv::new()?;
                Ok(env.flake_passthrough(&pass)?)
            })
            .await?;
            if !status.success() {
                std::process::exit(status.code().unwrap_or(1));
            }
            Ok(())
        }
        FlakeLocation::Local(dir) => {
            let attr = resolved.attr;
            let program = blocking(move || {
                require_flake(&dir)?;
                let env = NixEnv::new()?;
                ensure_lock(&env, &dir)?;
                let attr = installable::resolve_attr_path(&attr, "packages", env.system());
                let paths = env.build(&dir, &attr, None)?;
                let Some(store_path) = paths.last().cloned() else {
                    bail!("nix-build produced no store path for '{attr}'");
                };

                // The binary name comes from the derivation itself
                let options = EvalOptions {
                    json: true,
                    apply: Some(
                        "v: v.meta.mainProgram or v.pname or (builtins.parseDrvName v.name).name"
                            .to_string(),
                    ),
                    ..EvalOptions::default()
                };
                let name: String = serde_json::from_str(&env.eval(&dir, &attr, &options)?)
                    .context("could not determine the program name")?;
                Ok(format!("{store_path}/bin/{name}"))
            })
            .await?;

            let status = Command::new(&program)
                .args(&args)
                .status()
                .with_context(|| format!("failed to run {program}"))?;
            if !status.success() {
                std::process::exit(status.code().unwrap_or(1));
            }
            Ok(())
        }
    }
}
