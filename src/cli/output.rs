//! Output formatting and progress indicators
//!
//! Lock changes are rendered the way nix itself reports them, so output
//! stays familiar (and diffable) next to native flake tooling. Everything
//! here writes to stderr; stdout is reserved for command results.

use std::path::Path;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::core::lock::LockNode;
use crate::core::sync::{AddedEntry, ChangeSet};

/// Create a spinner for operations with unknown duration
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.blue} {msg}")
            .expect("Invalid spinner template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Locked coordinates plus the last-modified date, nix style:
/// `'github:owner/repo/rev' (2024-05-01)`.
pub fn format_locked_url(node: &LockNode) -> String {
    let Some(locked) = &node.locked else {
        return String::from("'<unresolved>'");
    };
    let summary = locked.summary();
    match locked
        .last_modified
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
    {
        Some(date) => format!("'{summary}' ({})", date.format("%Y-%m-%d")),
        None => format!("'{summary}'"),
    }
}

/// Print a change-set in nix's lock-file report format.
pub fn render_lock_changes(lock_path: &Path, changes: &ChangeSet, created: bool) {
    if changes.is_empty() {
        return;
    }
    let verb = if created { "creating" } else { "updating" };
    eprintln!(
        "{} {verb} lock file '{}':",
        style("warning:").yellow(),
        lock_path.display()
    );
    for (name, entry) in &changes.added {
        eprintln!(
            "{} {} {}:",
            style("•").magenta(),
            style("Added input").magenta(),
            style(format!("'{name}'")).bold()
        );
        match entry {
            AddedEntry::Node(node) => {
                eprintln!("    {}", style(format_locked_url(node)).cyan());
            }
            AddedEntry::Follows(path) => {
                eprintln!(
                    "    {} {}",
                    style("follows").magenta(),
                    style(format!("'{}'", path.join("/"))).cyan()
                );
            }
        }
    }
    for (name, old, new) in &changes.updated {
        eprintln!(
            "{} {} {}:",
            style("•").magenta(),
            style("Updated input").magenta(),
            style(format!("'{name}'")).bold()
        );
        eprintln!("    {}", style(format_locked_url(old)).cyan());
        eprintln!("  → {}", style(format_locked_url(new)).cyan());
    }
    for name in &changes.removed {
        eprintln!(
            "{} {} {}",
            style("•").magenta(),
            style("Removed input").magenta(),
            style(format!("'{name}'")).bold()
        );
    }
}

/// Print the "already at" notice for overrides that changed nothing.
pub fn render_already_pinned(pinned: &[(String, String)]) {
    for (name, rev) in pinned {
        eprintln!(
            "{} input {} already at {}",
            style("warning:").yellow(),
            style(format!("'{name}'")).bold(),
            style(rev).cyan()
        );
    }
}

/// Display an error with its cause chain.
pub fn display_error(error: &anyhow::Error) {
    eprintln!("{} {error}", style("error:").red().bold());
    for cause in error.chain().skip(1) {
        eprintln!("  {} {cause}", style("caused by:").red());
    }
}
