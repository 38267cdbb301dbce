//! CLI implementation for `renix profile`
//!
//! Keeps a nix-profile-compatible manifest and generation chain. Local
//! flakes are built through the legacy toolchain; remote installables are
//! handed to native `nix profile`.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Result};
use console::style;
use tracing::warn;

use crate::core::installable::{self, FlakeLocation, Installable};
use crate::core::profile::{self, Manifest, Profile, ProfileElement};
use crate::core::registry::Registry;
use crate::infra::nix::{self, NixEnv};

use super::blocking;
use super::flake::{ensure_lock, require_flake};

/// `renix profile list`
pub async fn execute_list(json: bool) -> Result<()> {
    blocking(move || {
        let manifest = Profile::from_env().manifest();
        let active: Vec<(&String, &ProfileElement)> = manifest
            .elements
            .iter()
            .filter(|(_, element)| element.active)
            .collect();

        if json {
            let entries: Vec<serde_json::Value> = active
                .iter()
                .map(|(name, element)| {
                    serde_json::json!({
                        "name": name,
                        "storePaths": element.store_paths,
                        "originalUrl": element.original_url,
                        "attrPath": element.attr_path,
                        "priority": element.priority,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }

        if active.is_empty() {
            println!("No packages installed.");
            return Ok(());
        }
        for (index, (name, element)) in active.iter().enumerate() {
            if index > 0 {
                println!();
            }
            println!("Name:               {}", style(name).bold());
            if !element.attr_path.is_empty() {
                println!("Flake attribute:    {}", element.attr_path);
            }
            if !element.original_url.is_empty() {
                println!("Original flake URL: {}", element.original_url);
            }
            if let Some((first, rest)) = element.store_paths.split_first() {
                println!("Store paths:        {first}");
                for path in rest {
                    println!("                    {path}");
                }
            }
        }
        Ok(())
    })
    .await
}

/// `renix profile add`
pub async fn execute_add(installables: Vec<String>) -> Result<()> {
    let registry = Registry::from_env();
    for installable in installables {
        let resolved = Installable::resolve(&installable, &registry).await?;
        match resolved.location {
            FlakeLocation::Remote(reference) => {
                // Remote installables go through native nix profile, which
                // owns revision resolution and substitution for them.
                let spec = format!("{reference}#{}", resolved.attr);
                let attr = resolved.attr.clone();
                let status = blocking(move || {
                    let env = NixEnv::new()?;
                    Ok(env.flake_passthrough(&[
                        "profile".to_string(),
                        "install".to_string(),
                        spec,
                    ])?)
                })
                .await?;
                if !status.success() {
                    std::process::exit(status.code().unwrap_or(1));
                }
                println!("Added {attr}");
            }
            FlakeLocation::Local(dir) => {
                let attr = resolved.attr.clone();
                let name = blocking(move || install_local(&dir, &attr)).await?;
                println!("Added {name}");
            }
        }
    }
    Ok(())
}

/// Install from a local directory: a pre-built store path is adopted
/// directly, anything else must be a flake and gets built first.
fn install_local(dir: &Path, attr: &str) -> Result<String> {
    let env = NixEnv::new()?;

    if dir.starts_with(nix::store_dir()) {
        let store_path = dir.display().to_string();
        let name = profile::store_path_package_name(&store_path);
        record_install(
            &env,
            &name,
            &store_path,
            format!("path:{store_path}"),
            String::new(),
        )?;
        return Ok(name);
    }

    require_flake(dir)?;
    ensure_lock(&env, dir)?;
    let attr_path = installable::resolve_attr_path(attr, "packages", env.system());
    // The default package takes the flake directory's name, matching nix
    let name = if attr == "default" {
        dir.file_name()
            .map_or_else(|| attr.to_string(), |n| n.to_string_lossy().into_owned())
    } else {
        attr.to_string()
    };
    let store_path = env.build_quiet(dir, &attr_path)?;
    if store_path.is_empty() {
        bail!("build of {attr_path} produced no output");
    }
    record_install(
        &env,
        &name,
        &store_path,
        format!("path:{}", dir.display()),
        attr_path,
    )?;
    Ok(name)
}

/// Write the element into the manifest and commit a new generation,
/// unless the same store path is already installed under that name.
fn record_install(
    env: &NixEnv,
    name: &str,
    store_path: &str,
    original_url: String,
    attr_path: String,
) -> Result<()> {
    let user_profile = Profile::from_env();
    let mut manifest = user_profile.manifest();
    if let Some(existing) = manifest.elements.get(name) {
        if existing.store_paths.first().map(String::as_str) == Some(store_path) {
            println!("{name} is already installed at this version");
            return Ok(());
        }
    }
    manifest.elements.insert(
        name.to_string(),
        ProfileElement::new(store_path.to_string(), original_url, attr_path),
    );
    commit_manifest(env, &user_profile, &manifest)
}

/// Stage the manifest with every package's contents, add the tree to the
/// store, and switch the profile onto the result.
fn commit_manifest(env: &NixEnv, user_profile: &Profile, manifest: &Manifest) -> Result<()> {
    let staging = tempfile::tempdir()?;
    let staged = profile::stage_profile(manifest, &manifest.store_paths(), staging.path())?;
    let store_path = env.store_add(&staged)?;
    user_profile.switch_to(Path::new(&store_path))?;
    Ok(())
}

/// `renix profile remove`
pub async fn execute_remove(names: Vec<String>) -> Result<()> {
    blocking(move || {
        let user_profile = Profile::from_env();
        let env = NixEnv::new()?;
        for name in names {
            let mut manifest = user_profile.manifest();
            let resolved = manifest.resolve_name(&name)?;
            manifest.elements.remove(&resolved);
            commit_manifest(&env, &user_profile, &manifest)?;
            println!("Removed {resolved}");
        }
        Ok(())
    })
    .await
}

/// `renix profile upgrade`
pub async fn execute_upgrade(name: Option<String>) -> Result<()> {
    blocking(move || {
        let user_profile = Profile::from_env();
        let mut manifest = user_profile.manifest();
        let targets = manifest.local_elements(name.as_deref());
        if targets.is_empty() {
            println!("No local packages to upgrade");
            return Ok(());
        }

        let env = NixEnv::new()?;
        let mut upgraded = 0;
        let mut skipped = 0;
        for (pkg, element) in targets {
            // Direct store-path installs carry no attribute to rebuild
            if element.attr_path.is_empty() {
                skipped += 1;
                continue;
            }
            let Some(dir) = profile::local_flake_dir(&element) else {
                skipped += 1;
                continue;
            };
            if !dir.is_dir() {
                warn!("{} no longer exists, skipping", dir.display());
                skipped += 1;
                continue;
            }
            let old = element.store_paths.first().cloned().unwrap_or_default();
            let new = match env.build_quiet(&dir, &element.attr_path) {
                Ok(path) => path,
                Err(err) => {
                    eprintln!("failed to build {pkg}: {err}");
                    skipped += 1;
                    continue;
                }
            };
            if new == old {
                skipped += 1;
                continue;
            }
            if let Some(entry) = manifest.elements.get_mut(&pkg) {
                entry.store_paths = vec![new];
                upgraded += 1;
            }
        }

        if upgraded > 0 {
            commit_manifest(&env, &user_profile, &manifest)?;
            println!("Upgraded {upgraded} package(s)");
        } else if skipped > 0 {
            println!("All {skipped} package(s) up to date");
        } else {
            println!("No local packages to upgrade");
        }
        Ok(())
    })
    .await
}

/// `renix profile history`
pub async fn execute_history() -> Result<()> {
    blocking(move || {
        let user_profile = Profile::from_env();
        let generations = user_profile.generations();
        if generations.is_empty() {
            println!("No profile generations found");
            return Ok(());
        }

        let count = generations.len();
        let mut previous = std::collections::BTreeMap::new();
        let mut previous_number = None;
        for (index, generation) in generations.iter().enumerate() {
            let date = generation.modified.map_or_else(
                || String::from("unknown"),
                |time| {
                    chrono::DateTime::<chrono::Local>::from(time)
                        .format("%Y-%m-%d")
                        .to_string()
                },
            );
            let number = if index + 1 == count {
                style(generation.number.to_string()).green().bold()
            } else {
                style(generation.number.to_string()).bold()
            };
            match previous_number {
                Some(prev) => println!("Version {number} ({date}) <- {prev}:"),
                None => println!("Version {number} ({date}):"),
            }

            let current = Manifest::load(&generation.target).active_versions();
            let mut changes = Vec::new();
            {
                let names: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();
                for package in names {
                    match (previous.get(package), current.get(package)) {
                        (None, Some(new)) => changes.push(format!("  {package}: ∅ -> {new}")),
                        (Some(old), None) => changes.push(format!("  {package}: {old} -> ∅")),
                        (Some(old), Some(new)) if old != new => {
                            changes.push(format!("  {package}: {old} -> {new}"));
                        }
                        _ => {}
                    }
                }
            }
            if changes.is_empty() {
                println!("  No changes.");
            } else {
                for change in &changes {
                    println!("{change}");
                }
            }
            println!();

            previous_number = Some(generation.number);
            previous = current;
        }
        Ok(())
    })
    .await
}

/// `renix profile rollback`
pub async fn execute_rollback() -> Result<()> {
    blocking(move || {
        let user_profile = Profile::from_env();
        let number = user_profile.rollback()?;
        println!("Rolled back to generation {number}");
        Ok(())
    })
    .await
}
