use futures::future::BoxFuture;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{PackageSource, SourceProbe, SourceReport};
use crate::constants::SOURCE_CHECK_TIMEOUT;

static FUNCTION_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("function name pattern is valid")
});

/// Sources the script and calls its first positional argument; the script
/// path and function name never pass through shell parsing.
const BASH_TRAMPOLINE: &str = r#"set -euo pipefail; source "$1"; "$2""#;

/// Whether `name` can be called as a bash function.
pub fn is_valid_function_name(name: &str) -> bool {
    FUNCTION_NAME_RE.is_match(name)
}

/// Asks a function of the update script for installed and available versions.
///
/// The function prints the installed version on its first line and the
/// available one on its second. An empty first line means "not installed".
#[derive(Debug, Clone)]
pub struct ScriptVersionProbe {
    source: PackageSource,
    script: PathBuf,
    function: String,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl ScriptVersionProbe {
    pub fn new(source: PackageSource, script: &Path, function: impl Into<String>) -> Self {
        Self {
            source,
            script: script.to_path_buf(),
            function: function.into(),
            env: Vec::new(),
            timeout: SOURCE_CHECK_TIMEOUT,
        }
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self) -> SourceReport {
        if !is_valid_function_name(&self.function) {
            return SourceReport::failed(
                self.source,
                format!("Invalid function name: {:?}", self.function),
            );
        }
        if !self.script.is_file() {
            return SourceReport::failed(
                self.source,
                format!("Script not found: {}", self.script.display()),
            );
        }
        let Ok(bash) = which::which("bash") else {
            return SourceReport::failed(self.source, "bash not found");
        };

        let mut cmd = Command::new(bash);
        cmd.arg("-c")
            .arg(BASH_TRAMPOLINE)
            .arg("bash")
            .arg(&self.script)
            .arg(&self.function)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = self.script.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        debug!(target: "checks", "Calling {} from {}", self.function, self.script.display());
        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => return SourceReport::failed(self.source, format!("Failed to run bash: {e}")),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
            return SourceReport::failed(
                self.source,
                if detail.is_empty() {
                    format!("{} exited with {}", self.function, output.status)
                } else {
                    format!("{} failed: {detail}", self.function)
                },
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (current, available) = parse_version_pair(&stdout);
        if available.is_none() {
            return SourceReport::failed(
                self.source,
                format!("{} did not report an available version", self.function),
            );
        }
        SourceReport::versions(self.source, current, available)
    }
}

impl SourceProbe for ScriptVersionProbe {
    fn source(&self) -> PackageSource {
        self.source
    }

    fn probe(&self) -> BoxFuture<'_, SourceReport> {
        Box::pin(self.run())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn parse_version_pair(output: &str) -> (Option<String>, Option<String>) {
    let mut lines = output.lines().map(str::trim);
    let non_empty = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(ToString::to_string);
    let current = non_empty(lines.next());
    let available = non_empty(lines.next());
    (current, available)
}
