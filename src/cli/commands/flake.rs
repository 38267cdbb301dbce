//! CLI implementation for the `renix flake` subcommands
//!
//! Lock and update drive the core synchronization engine; metadata, show,
//! and check evaluate the flake through the legacy toolchain. Remote
//! references are passed through to `nix` untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use console::style;
use futures::stream::{self, StreamExt};

use crate::cli::output;
use crate::config::defaults::{FLAKE_FILE_NAME, LOCK_FILE_NAME};
use crate::core::installable::{self, FlakeLocation, Installable};
use crate::core::inputs::parse_inputs;
use crate::core::lock::{self, InputRef, LockDocument};
use crate::core::registry::Registry;
use crate::core::sync::{self, SyncReport};
use crate::core::update;
use crate::infra::nix::NixEnv;

use super::blocking;

/// Fail unless the directory holds a flake.nix.
pub(crate) fn require_flake(dir: &Path) -> Result<()> {
    if !dir.join(FLAKE_FILE_NAME).exists() {
        bail!("no flake.nix found in {}", dir.display());
    }
    Ok(())
}

/// Bring flake.lock in sync with the declared inputs, reporting changes.
pub(crate) fn ensure_lock(env: &NixEnv, dir: &Path) -> Result<SyncReport> {
    let declared = parse_inputs(env.flake_inputs(dir)?);
    let lock_path = dir.join(LOCK_FILE_NAME);
    let report = sync::sync_to_path(env, &declared, &lock_path)?;
    output::render_lock_changes(&lock_path, &report.changes, report.created);
    Ok(report)
}

/// Resolve a flake reference argument to a local directory, or pass the
/// named `nix flake` subcommand through for remote references.
async fn local_dir_or_passthrough(flake_ref: &str, subcommand: &str) -> Result<Option<PathBuf>> {
    let registry = Registry::from_env();
    let resolved = Installable::resolve(flake_ref, &registry).await?;
    match resolved.location {
        FlakeLocation::Local(dir) => Ok(Some(dir)),
        FlakeLocation::Remote(reference) => {
            let args = vec!["flake".to_string(), subcommand.to_string(), reference];
            let status = blocking(move || {
                let env = NixEnv::new()?;
                Ok(env.flake_passthrough(&args)?)
            })
            .await?;
            if !status.success() {
                std::process::exit(status.code().unwrap_or(1));
            }
            Ok(None)
        }
    }
}

/// `renix flake lock`
pub async fn execute_lock(flake_ref: &str) -> Result<()> {
    let Some(dir) = local_dir_or_passthrough(flake_ref, "lock").await? else {
        return Ok(());
    };
    blocking(move || {
        require_flake(&dir)?;
        let env = NixEnv::new()?;
        ensure_lock(&env, &dir)?;
        Ok(())
    })
    .await
}

/// `renix flake update`
pub async fn execute_update(input: Option<String>, overrides: Vec<(String, String)>) -> Result<()> {
    let dir = std::env::current_dir()?;
    blocking(move || {
        require_flake(&dir)?;
        let env = NixEnv::new()?;
        let declared = parse_inputs(env.flake_inputs(&dir)?);
        let lock_path = dir.join(LOCK_FILE_NAME);
        let report =
            update::update_to_path(&env, &declared, &lock_path, input.as_deref(), &overrides)?;
        output::render_lock_changes(&lock_path, &report.changes, report.created);
        output::render_already_pinned(&report.already_pinned);
        Ok(())
    })
    .await
}

/// `renix flake metadata`
pub async fn execute_metadata(flake_ref: &str) -> Result<()> {
    let Some(dir) = local_dir_or_passthrough(flake_ref, "metadata").await? else {
        return Ok(());
    };
    let document = blocking({
        let dir = dir.clone();
        move || {
            require_flake(&dir)?;
            let env = NixEnv::new()?;
            if let Some(description) = env.flake_description(&dir)? {
                println!("{} {description}", style("Description:").bold());
            }
            Ok(lock::load(&dir.join(LOCK_FILE_NAME)))
        }
    })
    .await?;
    println!("{} {}", style("Path:").bold(), dir.display());
    println!("{}", style("Inputs:").bold());
    render_input_tree(&document);
    Ok(())
}

/// Print the locked input tree with box-drawing characters, the way
/// `nix flake metadata` does.
fn render_input_tree(document: &LockDocument) {
    fn walk(
        document: &LockDocument,
        node_name: &str,
        prefix: &str,
        trail: &mut Vec<String>,
    ) {
        let Some(node) = document.nodes.get(node_name) else {
            return;
        };
        let inputs: Vec<_> = node.inputs.iter().flatten().collect();
        let count = inputs.len();
        for (index, (name, reference)) in inputs.into_iter().enumerate() {
            let last = index + 1 == count;
            let branch = if last { "└───" } else { "├───" };
            let continuation = if last { "    " } else { "│   " };
            match reference {
                InputRef::Follows(path) => {
                    println!(
                        "{prefix}{branch}{name} follows input '{}'",
                        style(path.join("/")).cyan()
                    );
                }
                InputRef::Node(target) => {
                    let summary = document
                        .nodes
                        .get(target)
                        .and_then(|n| n.locked.as_ref())
                        .map(|locked| locked.summary())
                        .unwrap_or_else(|| String::from("<unresolved>"));
                    println!("{prefix}{branch}{name}: {}", style(summary).cyan());
                    // A name already on the trail would recurse forever
                    if !trail.contains(target) {
                        trail.push(target.clone());
                        walk(document, target, &format!("{prefix}{continuation}"), trail);
                        trail.pop();
                    }
                }
            }
        }
    }
    walk(document, &document.root, "", &mut Vec::new());
}

/// `renix flake show`
pub async fn execute_show(flake_ref: &str, jobs: usize) -> Result<()> {
    let Some(dir) = local_dir_or_passthrough(flake_ref, "show").await? else {
        return Ok(());
    };

    let env = Arc::new(
        blocking({
            let dir = dir.clone();
            move || {
                require_flake(&dir)?;
                let env = NixEnv::new()?;
                ensure_lock(&env, &dir)?;
                Ok(env)
            }
        })
        .await?,
    );

    // The lock change report goes to stderr; the spinner must not start
    // redrawing until it is fully printed.
    let spinner = output::create_spinner("evaluating flake outputs");
    let categories = {
        let env = Arc::clone(&env);
        let dir = dir.clone();
        blocking(move || Ok(env.output_categories(&dir)?)).await?
    };

    // Per-category evaluation fans out through a bounded pool; results
    // land in an ordered map so output order is reproducible.
    let entries: BTreeMap<String, Vec<String>> = stream::iter(categories)
        .map(|category| {
            let env = Arc::clone(&env);
            let dir = dir.clone();
            async move {
                let names = blocking({
                    let category = category.clone();
                    move || Ok(env.category_entries(&dir, &category)?)
                })
                .await
                .unwrap_or_default();
                (category, names)
            }
        })
        .buffer_unordered(jobs.max(1))
        .collect()
        .await;
    spinner.finish_and_clear();

    let system = env.system().to_string();
    println!("{}", style(format!("path:{}", dir.display())).bold());
    let count = entries.len();
    for (index, (category, names)) in entries.iter().enumerate() {
        let last = index + 1 == count;
        let branch = if last { "└───" } else { "├───" };
        let continuation = if last { "    " } else { "│   " };
        println!("{branch}{category}");
        if installable::is_per_system_category(category) {
            let omitted = category == "legacyPackages";
            println!("{continuation}└───{}", style(&system).dim());
            for (i, name) in names.iter().enumerate() {
                let inner = if i + 1 == names.len() { "└───" } else { "├───" };
                println!("{continuation}    {inner}{name}");
            }
            if omitted {
                println!("{continuation}    └───{}", style("(omitted)").dim());
            }
        } else {
            for (i, name) in names.iter().enumerate() {
                let inner = if i + 1 == names.len() { "└───" } else { "├───" };
                println!("{continuation}{inner}{name}");
            }
        }
    }
    Ok(())
}

/// `renix flake check`
pub async fn execute_check(flake_ref: &str, jobs: usize) -> Result<()> {
    let Some(dir) = local_dir_or_passthrough(flake_ref, "check").await? else {
        return Ok(());
    };

    let env = Arc::new(
        blocking({
            let dir = dir.clone();
            move || {
                require_flake(&dir)?;
                let env = NixEnv::new()?;
                ensure_lock(&env, &dir)?;
                Ok(env)
            }
        })
        .await?,
    );

    let checks = {
        let env = Arc::clone(&env);
        let dir = dir.clone();
        blocking(move || Ok(env.category_entries(&dir, "checks")?)).await?
    };
    if checks.is_empty() {
        println!("no checks defined");
        return Ok(());
    }

    let system = env.system().to_string();
    println!("running {} check(s)...", checks.len());
    let results: Vec<(String, Result<String>)> = stream::iter(checks)
        .map(|name| {
            let env = Arc::clone(&env);
            let dir = dir.clone();
            let attr = format!("checks.{system}.{name}");
            async move {
                let result = blocking(move || Ok(env.build_quiet(&dir, &attr)?)).await;
                (name, result)
            }
        })
        .buffer_unordered(jobs.max(1))
        .collect()
        .await;

    let mut failed = 0;
    for (name, result) in results {
        match result {
            Ok(_) => println!("{} {name}", style("✓").green()),
            Err(err) => {
                failed += 1;
                println!("{} {name}", style("✗").red());
                eprintln!("  {err}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} check(s) failed");
    }
    println!("all checks passed");
    Ok(())
}
