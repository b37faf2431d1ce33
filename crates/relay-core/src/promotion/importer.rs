//! Import targets
//!
//! The controller hands a resolved configuration to an [`Importer`]. The
//! outcome is opaque: anything but success is an [`ImportError`] carrying the
//! target's reason, and it is never retried automatically.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::artifact::Artifact;
use crate::error::ImportError;
use crate::template::ResolvedConfig;
use crate::types::Environment;

const STDERR_TAIL_LINES: usize = 20;

pub struct ImportRequest<'a> {
    pub artifact: &'a Artifact,
    pub environment: &'a Environment,
    pub config: &'a ResolvedConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReceipt {
    pub detail: String,
}

pub trait Importer: Send + Sync {
    fn import(&self, request: &ImportRequest<'_>) -> Result<ImportReceipt, ImportError>;
}

/// Runs an external program once per import.
///
/// The resolved configuration is written to a private temporary file that is
/// removed when the program exits. The program sees:
///
/// - `RELAY_ARTIFACT`: artifact name
/// - `RELAY_ENVIRONMENT`: target environment
/// - `RELAY_METADATA_PATH`: export metadata
/// - `RELAY_ARTIFACT_DIR`: published artifact directory
/// - `RELAY_CONFIG_PATH`: resolved configuration file
/// - `RELAY_TEMPLATE_STATUS`: `ready`, `empty`, `fallback` or `missing`
///
/// When the export shipped database scripts, also:
///
/// - `RELAY_DB_SCRIPTS`: JSON array of script paths
/// - `RELAY_DATA_SOURCE`: data source from the export response
/// - `RELAY_DB_SCRIPTS_MANIFEST`: JSON array of the manifest's script entries
#[derive(Debug, Clone)]
pub struct CommandImporter {
    argv: Vec<String>,
    work_dir: PathBuf,
}

impl CommandImporter {
    pub fn new(argv: Vec<String>, work_dir: PathBuf) -> anyhow::Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            anyhow::bail!("Importer command must name a program");
        }
        Ok(Self { argv, work_dir })
    }

    fn failure(&self, request: &ImportRequest<'_>, reason: impl Into<String>) -> ImportError {
        ImportError {
            artifact_name: request.artifact.artifact_name.clone(),
            environment: request.environment.name.clone(),
            reason: reason.into(),
        }
    }
}

impl Importer for CommandImporter {
    fn import(&self, request: &ImportRequest<'_>) -> Result<ImportReceipt, ImportError> {
        let mut config_file = tempfile::Builder::new()
            .prefix("relay-config-")
            .suffix(".tmp")
            .tempfile()
            .map_err(|e| self.failure(request, format!("cannot stage configuration: {e}")))?;
        config_file
            .write_all(request.config.content().as_bytes())
            .and_then(|()| config_file.flush())
            .map_err(|e| self.failure(request, format!("cannot stage configuration: {e}")))?;

        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .current_dir(&self.work_dir)
            .env("RELAY_ARTIFACT", &request.artifact.artifact_name)
            .env("RELAY_ENVIRONMENT", &request.environment.name)
            .env("RELAY_METADATA_PATH", &request.artifact.metadata_path)
            .env("RELAY_ARTIFACT_DIR", &request.artifact.artifact_dir)
            .env("RELAY_CONFIG_PATH", config_file.path())
            .env(
                "RELAY_TEMPLATE_STATUS",
                request.artifact.template_status.to_string(),
            )
            .stdin(Stdio::null());
        for (name, value) in db_script_env(request.artifact) {
            command.env(name, value);
        }

        let output = command
            .output()
            .map_err(|e| self.failure(request, format!("cannot run '{}': {e}", self.argv[0])))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_lines(&stderr, STDERR_TAIL_LINES);
            let reason = if tail.is_empty() {
                format!("importer exited with {}", output.status)
            } else {
                format!("importer exited with {}: {}", output.status, tail)
            };
            return Err(self.failure(request, reason));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("importer exited successfully")
            .to_string();

        Ok(ImportReceipt { detail })
    }
}

fn db_script_env(artifact: &Artifact) -> Vec<(&'static str, String)> {
    let scripts = &artifact.db_scripts;
    let mut env = Vec::new();
    if !scripts.scripts.is_empty() {
        let paths: Vec<PathBuf> = scripts
            .scripts
            .iter()
            .map(|script| artifact.artifact_dir.join(script))
            .collect();
        env.push(("RELAY_DB_SCRIPTS", serde_json::json!(paths).to_string()));
    }
    if let Some(data_source) = &scripts.data_source {
        env.push(("RELAY_DATA_SOURCE", data_source.clone()));
    }
    if !scripts.manifest.is_empty() {
        env.push((
            "RELAY_DB_SCRIPTS_MANIFEST",
            serde_json::json!(scripts.manifest).to_string(),
        ));
    }
    env
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
