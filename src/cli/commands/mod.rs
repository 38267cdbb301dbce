//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod build;
pub mod develop;
pub mod eval;
pub mod flake;
pub mod profile;
pub mod registry;
pub mod run;

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::config::defaults::{DEFAULT_CHECK_JOBS, DEFAULT_EVAL_JOBS};

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a flake output attribute
    Build {
        /// Installable (flake reference plus optional #attribute)
        #[arg(default_value = ".")]
        installable: String,

        /// Name for the result symlink
        #[arg(short, long)]
        out_link: Option<String>,

        /// Do not create a result symlink
        #[arg(long)]
        no_link: bool,
    },

    /// Enter a development shell for a flake output
    Develop {
        /// Installable (flake reference plus optional #attribute)
        #[arg(default_value = ".")]
        installable: String,

        /// Run a command instead of an interactive shell
        #[arg(short, long)]
        command: Option<String>,
    },

    /// Build and run a flake application
    Run {
        /// Installable (flake reference plus optional #attribute)
        #[arg(default_value = ".")]
        installable: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Evaluate a flake output attribute
    Eval {
        /// Installable (flake reference plus optional #attribute)
        #[arg(default_value = ".")]
        installable: String,

        /// Evaluate a raw expression instead of a flake attribute
        #[arg(long)]
        expr: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Output raw strings without quotes
        #[arg(long)]
        raw: bool,

        /// Apply a function to the value before printing
        #[arg(long)]
        apply: Option<String>,
    },

    /// Flake management commands
    Flake {
        #[command(subcommand)]
        command: FlakeCommands,
    },

    /// Manage installed packages
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Flake registry commands
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
}

/// Profile management subcommands
#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// List installed packages
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build packages and add them to the profile
    #[command(alias = "install")]
    Add {
        /// Installables (flake reference plus optional #attribute)
        #[arg(required = true)]
        installables: Vec<String>,
    },

    /// Remove packages from the profile
    Remove {
        /// Package names (a unique name fragment is accepted)
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Rebuild locally installed packages and update the profile
    Upgrade {
        /// Package to upgrade (all local packages when omitted)
        name: Option<String>,
    },

    /// Show the profile generation history
    History,

    /// Switch back to the previous profile generation
    Rollback,
}

/// Flake management subcommands
#[derive(Subcommand, Debug)]
pub enum FlakeCommands {
    /// Show flake description and locked inputs
    Metadata {
        /// Flake directory or reference
        #[arg(default_value = ".")]
        flake_ref: String,
    },

    /// Show the outputs provided by a flake
    Show {
        /// Flake directory or reference
        #[arg(default_value = ".")]
        flake_ref: String,

        /// Number of parallel evaluations
        #[arg(short, long, default_value_t = DEFAULT_EVAL_JOBS)]
        jobs: usize,
    },

    /// Build all flake checks
    Check {
        /// Flake directory or reference
        #[arg(default_value = ".")]
        flake_ref: String,

        /// Number of parallel builds
        #[arg(short, long, default_value_t = DEFAULT_CHECK_JOBS)]
        jobs: usize,
    },

    /// Create or update flake.lock without building
    Lock {
        /// Flake directory
        #[arg(default_value = ".")]
        flake_ref: String,
    },

    /// Update locked inputs to their latest revisions
    Update {
        /// Specific input to update (updates all if not specified)
        input: Option<String>,

        /// Pin an input to a specific flake reference
        #[arg(
            short = 'o',
            long = "override-input",
            num_args = 2,
            value_names = ["NAME", "REF"],
            action = clap::ArgAction::Append
        )]
        override_input: Vec<String>,
    },
}

/// Flake registry subcommands
#[derive(Subcommand, Debug)]
pub enum RegistryCommands {
    /// List all registry entries
    List,

    /// Resolve a registry name to its flake reference
    Resolve {
        /// Registry name (e.g. nixpkgs)
        name: String,
    },

    /// Add an entry to the user registry
    Add {
        /// Registry name
        name: String,

        /// Flake reference to map it to
        target: String,
    },

    /// Remove an entry from the user registry
    Remove {
        /// Registry name
        name: String,
    },
}

impl Commands {
    /// Execute the command
    pub async fn run(self) -> Result<()> {
        match self {
            Self::Build {
                installable,
                out_link,
                no_link,
            } => build::execute(&installable, out_link, no_link).await,
            Self::Develop {
                installable,
                command,
            } => develop::execute(&installable, command).await,
            Self::Run { installable, args } => run::execute(&installable, args).await,
            Self::Eval {
                installable,
                expr,
                json,
                raw,
                apply,
            } => eval::execute(&installable, expr, json, raw, apply).await,
            Self::Flake { command } => match command {
                FlakeCommands::Metadata { flake_ref } => flake::execute_metadata(&flake_ref).await,
                FlakeCommands::Show { flake_ref, jobs } => {
                    flake::execute_show(&flake_ref, jobs).await
                }
                FlakeCommands::Check { flake_ref, jobs } => {
                    flake::execute_check(&flake_ref, jobs).await
                }
                FlakeCommands::Lock { flake_ref } => flake::execute_lock(&flake_ref).await,
                FlakeCommands::Update {
                    input,
                    override_input,
                } => {
                    let overrides = pair_overrides(override_input)?;
                    flake::execute_update(input, overrides).await
                }
            },
            Self::Profile { command } => match command {
                ProfileCommands::List { json } => profile::execute_list(json).await,
                ProfileCommands::Add { installables } => profile::execute_add(installables).await,
                ProfileCommands::Remove { names } => profile::execute_remove(names).await,
                ProfileCommands::Upgrade { name } => profile::execute_upgrade(name).await,
                ProfileCommands::History => profile::execute_history().await,
                ProfileCommands::Rollback => profile::execute_rollback().await,
            },
            Self::Registry { command } => match command {
                RegistryCommands::List => registry::execute_list().await,
                RegistryCommands::Resolve { name } => registry::execute_resolve(&name).await,
                RegistryCommands::Add { name, target } => {
                    registry::execute_add(&name, &target).await
                }
                RegistryCommands::Remove { name } => registry::execute_remove(&name).await,
            },
        }
    }
}

/// Fold the flat `--override-input NAME REF` argument list into pairs.
fn pair_overrides(flat: Vec<String>) -> Result<Vec<(String, String)>> {
    if flat.len() % 2 != 0 {
        anyhow::bail!("--override-input requires NAME and REF");
    }
    Ok(flat
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

/// Run blocking toolchain work off the async executor.
pub(crate) async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("background task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_overrides() {
        let pairs = pair_overrides(vec![
            "nixpkgs".into(),
            "github:NixOS/nixpkgs/abc".into(),
            "utils".into(),
            "main".into(),
        ])
        .unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "nixpkgs");
        assert_eq!(pairs[1].1, "main");
    }

    #[test]
    fn test_pair_overrides_odd_count_fails() {
        assert!(pair_overrides(vec!["nixpkgs".into()]).is_err());
    }
}
