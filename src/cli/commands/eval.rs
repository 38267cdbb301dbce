//! CLI implementation for `renix eval`

use anyhow::Result;

use crate::core::installable::{FlakeLocation, Installable};
use crate::core::registry::Registry;
use crate::infra::nix::{EvalOptions, NixEnv};

use super::blocking;
use super::flake::{ensure_lock, require_flake};

/// Execute the eval command
pub async fn execute(
    installable: &str,
    expr: Option<String>,
    json: bool,
    raw: bool,
    apply: Option<String>,
) -> Result<()> {
    let options = EvalOptions { json, raw, apply };

    // --expr bypasses flake resolution entirely
    if let Some(expr) = expr {
        let output = blocking(move || {
            let env = NixEnv::new()?;
            Ok(env.eval_expr(&expr, &options)?)
        })
        .await?;
        println!("{output}");
        return Ok(());
    }

    let registry = Registry::from_env();
    let resolved = Installable::resolve(installable, &registry).await?;
    match resolved.location {
        FlakeLocation::Remote(reference) => {
            let mut args = vec!["eval".to_string(), format!("{reference}#{}", resolved.attr)];
            if options.json {
                args.push("--json".to_string());
            }
            if options.raw {
                args.push("--raw".to_string());
            }
            if let Some(apply) = &options.apply {
                args.push("--apply".to_string());
                args.push(apply.clone());
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
            let output = blocking(move || {
                require_flake(&dir)?;
                let env = NixEnv::new()?;
                ensure_lock(&env, &dir)?;
                Ok(env.eval(&dir, &attr, &options)?)
            })
            .await?;
            println!("{output}");
            Ok(())
        }
    }
}
