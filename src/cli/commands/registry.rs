//! CLI implementation for `renix registry`

use anyhow::{bail, Result};
use console::style;

use crate::core::registry::Registry;

/// Execute the registry list command
pub async fn execute_list() -> Result<()> {
    let registry = Registry::from_env();
    for (name, source, target) in registry.list().await {
        println!(
            "{} flake:{name} {}",
            style(source).dim(),
            target.to_flake_ref()
        );
    }
    Ok(())
}

/// Execute the registry resolve command
pub async fn execute_resolve(name: &str) -> Result<()> {
    let registry = Registry::from_env();
    match registry.resolve(name).await {
        Some(target) => {
            println!("{}", target.to_flake_ref());
            Ok(())
        }
        None => bail!("'{name}' not found in any flake registry"),
    }
}

/// Execute the registry add command
pub async fn execute_add(name: &str, target: &str) -> Result<()> {
    let registry = Registry::from_env();
    registry.add(name, target)?;
    println!("added flake:{name} -> {target}");
    Ok(())
}

/// Execute the registry remove command
pub async fn execute_remove(name: &str) -> Result<()> {
    let registry = Registry::from_env();
    if registry.remove(name)? {
        println!("removed flake:{name}");
        Ok(())
    } else {
        bail!("'{name}' not found in the user registry")
    }
}
