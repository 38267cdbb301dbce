//! Nix toolchain wrapper
//!
//! Drives the legacy toolchain (`nix-build`, `nix-instantiate`,
//! `nix-shell`) plus `nix flake prefetch` for revision resolution. Flake
//! evaluation goes through two embedded expressions, materialized into a
//! temporary directory for the lifetime of the process: `inputs.nix`
//! resolves locked inputs from flake.lock, and `eval.nix` selects one
//! output attribute for nix-build/nix-shell.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use serde_json::Value;
use tracing::debug;

use crate::core::closure::SourceArchive;
use crate::core::gateway::{FetchGateway, PrefetchData};
use crate::core::inputs::RawInput;
use crate::error::{GatewayError, NixError};

const INPUTS_NIX: &str = include_str!("../nix/inputs.nix");
const EVAL_NIX: &str = include_str!("../nix/eval.nix");

/// Handle to the nix toolchain.
///
/// Construction materializes the embedded evaluation expressions and
/// detects the current system once; both are reused for every call.
#[derive(Debug)]
pub struct NixEnv {
    system: String,
    eval_dir: tempfile::TempDir,
}

/// Output options for [`NixEnv::eval`].
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    pub json: bool,
    pub raw: bool,
    pub apply: Option<String>,
}

impl NixEnv {
    pub fn new() -> Result<Self, NixError> {
        // Everything here runs through the legacy toolchain; failing fast
        // beats a confusing spawn error later.
        for tool in ["nix-instantiate", "nix-build"] {
            if which::which(tool).is_err() {
                return Err(NixError::ToolchainMissing {
                    tool: tool.to_string(),
                });
            }
        }
        let eval_dir = tempfile::tempdir().map_err(|e| NixError::Spawn {
            command: "tempdir".to_string(),
            message: e.to_string(),
        })?;
        for (name, content) in [("inputs.nix", INPUTS_NIX), ("eval.nix", EVAL_NIX)] {
            std::fs::write(eval_dir.path().join(name), content).map_err(|e| {
                NixError::Spawn {
                    command: name.to_string(),
                    message: e.to_string(),
                }
            })?;
        }
        Ok(Self {
            system: detect_system(),
            eval_dir,
        })
    }

    /// The current nix system (e.g. `x86_64-linux`).
    pub fn system(&self) -> &str {
        &self.system
    }

    /// Evaluate a raw expression with `nix-instantiate --eval --json`.
    pub fn eval_json(&self, expr: &str) -> Result<Value, NixError> {
        let output = capture(
            clean_command("nix-instantiate")
                .args(["--eval", "--expr", expr, "--json", "--strict", "--read-write-mode"]),
            "nix-instantiate",
        )?;
        serde_json::from_str(&output).map_err(|e| NixError::Parse {
            command: "nix-instantiate".to_string(),
            message: e.to_string(),
        })
    }

    /// Extract the declared inputs of a flake.nix.
    ///
    /// One `nix-instantiate` call returns name, url, follows, flake-ness,
    /// and nested follows for every input; string-shorthand inputs are
    /// normalized to url-only records by the expression itself.
    pub fn flake_inputs(&self, flake_dir: &Path) -> Result<Vec<RawInput>, NixError> {
        let dir = nix_path(flake_dir);
        let expr = format!(
            r#"
            let
              flake = import {dir}/flake.nix;
              inputs = flake.inputs or {{}};

              getInputInfo = name:
                let
                  input = inputs.${{name}};
                  inputAttrs = if builtins.isAttrs input then input else {{ url = input; }};
                in {{
                  inherit name;
                  url = inputAttrs.url or null;
                  follows = inputAttrs.follows or null;
                  flake = inputAttrs.flake or true;
                  nestedFollows =
                    if inputAttrs ? inputs then
                      builtins.listToAttrs (
                        builtins.filter (x: x.value != null) (
                          map (nestedName: {{
                            name = nestedName;
                            value = inputAttrs.inputs.${{nestedName}}.follows or null;
                          }}) (builtins.attrNames inputAttrs.inputs)
                        )
                      )
                    else {{}};
                }};
            in map getInputInfo (builtins.attrNames inputs)
            "#
        );
        let value = self.eval_json(&expr)?;
        serde_json::from_value(value).map_err(|e| NixError::Parse {
            command: "nix-instantiate".to_string(),
            message: e.to_string(),
        })
    }

    /// The flake's `description` attribute, when present.
    pub fn flake_description(&self, flake_dir: &Path) -> Result<Option<String>, NixError> {
        let dir = nix_path(flake_dir);
        let value = self.eval_json(&format!("(import {dir}/flake.nix).description or null"))?;
        Ok(value.as_str().map(str::to_string))
    }

    /// Build one output attribute with nix-build, returning the store
    /// paths it printed. `out_link` of `None` means `--no-link`.
    pub fn build(
        &self,
        flake_dir: &Path,
        attr: &str,
        out_link: Option<&str>,
    ) -> Result<Vec<String>, NixError> {
        let mut command = clean_command("nix-build");
        command
            .arg(self.eval_dir.path().join("eval.nix"))
            .args(["--arg", "flakeDir", &nix_path(flake_dir)])
            .args(["--argstr", "system", &self.system])
            .args(["--argstr", "attr", attr]);
        match out_link {
            Some(link) => {
                command.args(["-o", link]);
            }
            None => {
                command.arg("--no-link");
            }
        }
        // Build progress goes straight to the terminal
        command.stderr(Stdio::inherit());
        let stdout = capture(&mut command, "nix-build")?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    /// Build one attribute quietly, capturing diagnostics. Used by
    /// `flake check` where many builds run concurrently.
    pub fn build_quiet(&self, flake_dir: &Path, attr: &str) -> Result<String, NixError> {
        let mut command = clean_command("nix-build");
        command
            .arg(self.eval_dir.path().join("eval.nix"))
            .args(["--arg", "flakeDir", &nix_path(flake_dir)])
            .args(["--argstr", "system", &self.system])
            .args(["--argstr", "attr", attr])
            .arg("--no-link");
        let stdout = capture(&mut command, "nix-build")?;
        Ok(stdout.trim().to_string())
    }

    /// Enter a nix-shell for one output attribute, optionally running a
    /// command instead of an interactive shell.
    pub fn shell(
        &self,
        flake_dir: &Path,
        attr: &str,
        run: Option<&str>,
    ) -> Result<ExitStatus, NixError> {
        let mut command = clean_command("nix-shell");
        command
            .arg(self.eval_dir.path().join("eval.nix"))
            .args(["--arg", "flakeDir", &nix_path(flake_dir)])
            .args(["--argstr", "system", &self.system])
            .args(["--argstr", "attr", attr]);
        if let Some(run) = run {
            command.args(["--command", run]);
        }
        command.status().map_err(|e| NixError::Spawn {
            command: "nix-shell".to_string(),
            message: e.to_string(),
        })
    }

    /// Evaluate one output attribute and return the printed result.
    ///
    /// The attribute is tried under `packages.<system>` and
    /// `legacyPackages.<system>` before being taken verbatim, matching
    /// `nix eval` fallback order.
    pub fn eval(
        &self,
        flake_dir: &Path,
        attr: &str,
        options: &EvalOptions,
    ) -> Result<String, NixError> {
        let preamble = self.preamble(flake_dir);
        let attr_list = attr_to_nix_list(attr);
        let value_expr = format!(
            r#"
            let
              {preamble}
              userAttrPath = {attr_list};
              effectiveAttrPath = if userAttrPath == [] then ["default"] else userAttrPath;
              pathsToTry = [
                (["packages" system] ++ effectiveAttrPath)
                (["legacyPackages" system] ++ effectiveAttrPath)
                effectiveAttrPath
              ];
              validPaths = builtins.filter (p: hasPath p outputs) pathsToTry;
              value =
                if validPaths == []
                then throw "flake does not provide attribute '{attr}'"
                else getPath (builtins.head validPaths) outputs;
            in value
            "#
        );
        let expr = match &options.apply {
            Some(apply) => format!("({apply}) ({value_expr})"),
            None => value_expr,
        };

        let mut command = clean_command("nix-instantiate");
        command.args(["--eval", "--expr", &expr, "--strict", "--read-write-mode"]);
        if options.json || options.raw {
            command.arg("--json");
        }
        let output = capture(&mut command, "nix-instantiate")?;
        let output = output.trim().to_string();
        if options.raw {
            // JSON output makes unquoting a parse instead of an unescape
            if let Ok(Value::String(text)) = serde_json::from_str(&output) {
                return Ok(text);
            }
        }
        Ok(output)
    }

    /// Evaluate an arbitrary expression in the flake's scope (for
    /// `eval --expr`).
    pub fn eval_expr(
        &self,
        expr: &str,
        options: &EvalOptions,
    ) -> Result<String, NixError> {
        let expr = match &options.apply {
            Some(apply) => format!("({apply}) ({expr})"),
            None => expr.to_string(),
        };
        let mut command = clean_command("nix-instantiate");
        command.args(["--eval", "--expr", &expr, "--strict", "--read-write-mode"]);
        if options.json || options.raw {
            command.arg("--json");
        }
        let output = capture(&mut command, "nix-instantiate")?;
        let output = output.trim().to_string();
        if options.raw {
            if let Ok(Value::String(text)) = serde_json::from_str(&output) {
                return Ok(text);
            }
        }
        Ok(output)
    }

    /// The names of the flake's top-level output categories.
    pub fn output_categories(&self, flake_dir: &Path) -> Result<Vec<String>, NixError> {
        let preamble = self.preamble(flake_dir);
        let value = self.eval_json(&format!(
            "let {preamble} in builtins.attrNames outputs"
        ))?;
        serde_json::from_value(value).map_err(|e| NixError::Parse {
            command: "nix-instantiate".to_string(),
            message: e.to_string(),
        })
    }

    /// Attribute names under one output category for the current system.
    ///
    /// Per-system categories are indexed by the current system first;
    /// `legacyPackages` is never enumerated (it can be all of nixpkgs).
    pub fn category_entries(
        &self,
        flake_dir: &Path,
        category: &str,
    ) -> Result<Vec<String>, NixError> {
        if category == "legacyPackages" {
            return Ok(Vec::new());
        }
        let preamble = self.preamble(flake_dir);
        let selector = if crate::core::installable::is_per_system_category(category) {
            format!("outputs.\"{category}\".${{system}} or {{}}")
        } else {
            format!("outputs.\"{category}\" or {{}}")
        };
        let value = self.eval_json(&format!(
            "let {preamble} sel = {selector}; in if builtins.isAttrs sel then builtins.attrNames sel else []"
        ))?;
        serde_json::from_value(value).map_err(|e| NixError::Parse {
            command: "nix-instantiate".to_string(),
            message: e.to_string(),
        })
    }

    /// Add a directory to the nix store verbatim, returning its store
    /// path. Used to materialize staged profile generations.
    pub fn store_add(&self, dir: &Path) -> Result<String, NixError> {
        let output = capture(
            clean_command("nix-store").arg("--add").arg(dir),
            "nix-store",
        )?;
        Ok(output.trim().to_string())
    }

    /// Hand a remote flake reference straight to `nix` with flakes
    /// enabled, inheriting the terminal.
    pub fn flake_passthrough(&self, args: &[String]) -> Result<ExitStatus, NixError> {
        let mut command = clean_command("nix");
        command
            .args(["--extra-experimental-features", "nix-command flakes"])
            .args(args);
        command.status().map_err(|e| NixError::Spawn {
            command: "nix".to_string(),
            message: e.to_string(),
        })
    }

    /// Common let-bindings for inline flake evaluation: system, flake,
    /// lock, inputs, outputs, and the path helpers.
    fn preamble(&self, flake_dir: &Path) -> String {
        let dir = nix_path(flake_dir);
        let inputs_nix = self.eval_dir.path().join("inputs.nix").display().to_string();
        let system = &self.system;
        format!(
            r#"
            system = "{system}";
            flake = import {dir}/flake.nix;
            lock =
              if builtins.pathExists ({dir}/flake.lock)
              then builtins.fromJSON (builtins.readFile ({dir}/flake.lock))
              else {{ nodes = {{ root = {{ inputs = {{}}; }}; }}; root = "root"; version = 7; }};
            inputs = import {inputs_nix} {{
              inherit lock system;
              flakeDirPath = {dir};
            }};
            outputs = flake.outputs (inputs // {{ self = inputs.self // outputs; }});

            hasPath = path: obj:
              if path == [] then true
              else if builtins.isAttrs obj && obj ? ${{builtins.head path}}
              then hasPath (builtins.tail path) obj.${{builtins.head path}}
              else false;

            getPath = path: obj:
              builtins.foldl' (o: k: o.${{k}}) obj path;
            "#
        )
    }
}

impl FetchGateway for NixEnv {
    /// `nix flake prefetch --json`: resolves the revision, fetches the
    /// tree, and reports the NAR hash. Respects access-tokens from
    /// nix.conf for private repositories.
    fn prefetch(&self, reference: &str) -> Result<PrefetchData, GatewayError> {
        debug!("prefetching {reference}");
        let output = capture(
            clean_command("nix").args([
                "--extra-experimental-features",
                "nix-command flakes",
                "flake",
                "prefetch",
                reference,
                "--json",
            ]),
            "nix flake prefetch",
        )
        .map_err(|e| GatewayError::Prefetch {
            reference: reference.to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&output).map_err(|e| GatewayError::Prefetch {
            reference: reference.to_string(),
            message: format!("unparseable prefetch output: {e}"),
        })
    }

    /// Fetch a locked source and read its flake.lock. Local paths are
    /// read straight off the filesystem; everything else goes through the
    /// builtin fetchers so the result is verified against the NAR hash.
    fn fetch_lock(&self, archive: &SourceArchive) -> Result<Option<Value>, GatewayError> {
        let expr = match archive {
            SourceArchive::Path(dir) => return Ok(read_local_lock(dir)),
            SourceArchive::Git {
                url,
                rev,
                ref_name,
                nar_hash,
            } => {
                let ref_part = ref_name
                    .as_deref()
                    .map(|r| format!("ref = \"{r}\";"))
                    .unwrap_or_default();
                let hash_part = if nar_hash.is_empty() {
                    String::new()
                } else {
                    format!("narHash = \"{nar_hash}\";")
                };
                format!(
                    r#"
                    let
                      src = builtins.fetchGit {{
                        url = "{url}";
                        rev = "{rev}";
                        {ref_part}
                        {hash_part}
                      }};
                      lockPath = src + "/flake.lock";
                    in
                      if builtins.pathExists lockPath
                      then builtins.readFile lockPath
                      else ""
                    "#
                )
            }
            SourceArchive::Tarball { url, nar_hash } => format!(
                r#"
                let
                  src = builtins.fetchTarball {{
                    url = "{url}";
                    sha256 = "{nar_hash}";
                  }};
                  lockPath = src + "/flake.lock";
                in
                  if builtins.pathExists lockPath
                  then builtins.readFile lockPath
                  else ""
                "#
            ),
        };

        let value = self.eval_json(&expr).map_err(|e| GatewayError::FetchTree {
            location: archive_location(archive),
            message: e.to_string(),
        })?;
        let Some(content) = value.as_str() else {
            return Ok(None);
        };
        if content.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(content).ok())
    }
}

/// The nix store directory, usually `/nix/store`.
pub fn store_dir() -> String {
    std::env::var("NIX_STORE_DIR").unwrap_or_else(|_| String::from("/nix/store"))
}

/// Read a local flake directory's lock file, tolerating absence and
/// malformed content.
fn read_local_lock(dir: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(dir.join("flake.lock")).ok()?;
    serde_json::from_str(&text).ok()
}

fn archive_location(archive: &SourceArchive) -> String {
    match archive {
        SourceArchive::Path(dir) => dir.display().to_string(),
        SourceArchive::Git { url, rev, .. } => format!("{url}@{rev}"),
        SourceArchive::Tarball { url, .. } => url.clone(),
    }
}

/// Detect the current nix system, with a compile-target fallback when the
/// toolchain is unavailable.
fn detect_system() -> String {
    let detected = capture(
        clean_command("nix-instantiate").args([
            "--eval",
            "--expr",
            "builtins.currentSystem",
            "--json",
        ]),
        "nix-instantiate",
    )
    .ok()
    .and_then(|out| serde_json::from_str::<String>(&out).ok());
    detected.unwrap_or_else(|| {
        format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
    })
}

/// A command with TMPDIR removed: a parent nix-shell's TMPDIR may vanish
/// under us, so nix gets the system default.
fn clean_command(program: &str) -> Command {
    let mut command = Command::new(program);
    command.env_remove("TMPDIR");
    command
}

/// Run a command and capture stdout, mapping failures to [`NixError`].
fn capture(command: &mut Command, label: &str) -> Result<String, NixError> {
    let output = command.output().map_err(|e| NixError::Spawn {
        command: label.to_string(),
        message: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(NixError::CommandFailed {
            command: label.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Render a path for interpolation into a nix expression. Nix path
/// literals must be absolute.
fn nix_path(path: &Path) -> String {
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    absolute.display().to_string()
}

/// Convert a dotted attribute path to a nix list literal.
fn attr_to_nix_list(attr: &str) -> String {
    let parts: Vec<String> = attr
        .split('.')
        .filter(|p| !p.is_empty())
        .map(|p| format!("\"{p}\""))
        .collect();
    format!("[{}]", parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_to_nix_list() {
        assert_eq!(
            attr_to_nix_list("packages.x86_64-linux.hello"),
            "[\"packages\" \"x86_64-linux\" \"hello\"]"
        );
        assert_eq!(attr_to_nix_list(""), "[]");
    }

    #[test]
    fn test_read_local_lock_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_local_lock(dir.path()).is_none());
    }

    #[test]
    fn test_read_local_lock_reads_lock() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("flake.lock"),
            r#"{"nodes": {"root": {"inputs": {}}}, "root": "root", "version": 7}"#,
        )
        .unwrap();
        let value = read_local_lock(dir.path()).unwrap();
        assert_eq!(value["version"], 7);
    }

    #[test]
    fn test_nix_path_is_absolute() {
        assert!(nix_path(Path::new("relative/dir")).starts_with('/'));
        assert_eq!(nix_path(Path::new("/abs/dir")), "/abs/dir");
    }
}
