use futures::future::BoxFuture;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{PackageSource, SourceProbe, SourceReport};
use crate::constants::SOURCE_CHECK_TIMEOUT;

/// Runs a package manager that prints one pending update per line.
///
/// Candidates are tried in order and the first one installed is used, so
/// `checkupdates` is preferred to `pacman -Qu` when both exist. A non-zero
/// exit is read as "nothing to update", which is how these tools report an
/// empty result.
#[derive(Debug, Clone)]
pub struct CommandListProbe {
    source: PackageSource,
    candidates: Vec<Vec<String>>,
    timeout: Duration,
}

impl CommandListProbe {
    pub fn new<I, C, S>(source: PackageSource, candidates: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source,
            candidates: candidates
                .into_iter()
                .map(|c| c.into_iter().map(Into::into).collect())
                .filter(|c: &Vec<String>| !c.is_empty())
                .collect(),
            timeout: SOURCE_CHECK_TIMEOUT,
        }
    }

    pub fn system() -> Self {
        Self::new(PackageSource::System, [vec!["checkupdates"], vec!["pacman", "-Qu"]])
    }

    pub fn aur() -> Self {
        Self::new(PackageSource::Aur, [["yay", "-Qua"], ["paru", "-Qua"]])
    }

    pub fn flatpak() -> Self {
        Self::new(
            PackageSource::Flatpak,
            [["flatpak", "remote-ls", "--updates", "--columns=application"]],
        )
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The first installed candidate, with its resolved program path.
    fn resolve(&self) -> Option<(PathBuf, &[String])> {
        self.candidates.iter().find_map(|candidate| {
            let (program, args) = candidate.split_first()?;
            which::which(program).ok().map(|path| (path, args))
        })
    }

    fn missing_tool_name(&self) -> String {
        let names: Vec<&str> = self
            .candidates
            .iter()
            .filter_map(|c| c.first().map(String::as_str))
            .collect();
        match names.as_slice() {
            [] => "no command configured".to_string(),
            [one] => format!("{one} not found"),
            many => format!("none of {} found", many.join(", ")),
        }
    }

    async fn run(&self) -> SourceReport {
        let Some((program, args)) = self.resolve() else {
            return SourceReport::failed(self.source, self.missing_tool_name());
        };

        debug!(target: "checks", "Running {} {}", program.display(), args.join(" "));
        let output = Command::new(&program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return SourceReport::failed(
                    self.source,
                    format!("Failed to run {}: {e}", program.display()),
                );
            }
        };

        if !output.status.success() {
            debug!(
                target: "checks",
                "{} exited with {}: {}",
                program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return SourceReport::packages(self.source, Vec::new());
        }

        SourceReport::packages(self.source, parse_package_lines(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl SourceProbe for CommandListProbe {
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

/// Package names from `name old -> new` style output.
pub(crate) fn parse_package_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| !name.starts_with("::") && !name.ends_with(':'))
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_package_lines() {
        let out = "linux 6.1-1 -> 6.2-1\n\nmesa 23.0-1 -> 23.1-1\nwarning: something\n";
        assert_eq!(parse_package_lines(out), vec!["linux", "mesa"]);
        assert!(parse_package_lines("").is_empty());
    }

    #[tokio::test]
    async fn test_first_installed_candidate_is_used() {
        let probe = CommandListProbe::new(
            PackageSource::System,
            [
                vec!["definitely-not-a-package-manager-xyz"],
                vec!["printf", "linux 1 -> 2\nmesa 3 -> 4\n"],
            ],
        );
        let report = probe.probe().await;
        assert_eq!(report.error, None);
        assert!(report.has_update);
        assert_eq!(report.package_count, Some(2));
        assert_eq!(report.package_names, vec!["linux", "mesa"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_means_no_updates() {
        let probe = CommandListProbe::new(PackageSource::Flatpak, [["false"]]);
        let report = probe.probe().await;
        assert_eq!(report.error, None);
        assert!(!report.has_update);
        assert_eq!(report.package_count, Some(0));
    }

    #[tokio::test]
    async fn test_missing_tool_is_an_error() {
        let probe = CommandListProbe::new(PackageSource::Aur, [["no-such-helper-abc", "-Qua"]]);
        let report = probe.probe().await;
        assert_eq!(report.error.as_deref(), Some("no-such-helper-abc not found"));
        assert!(!report.has_update);

        let probe = CommandListProbe::new(
            PackageSource::Aur,
            [["no-such-helper-abc"], ["no-such-helper-def"]],
        );
        assert_eq!(
            probe.probe().await.error.as_deref(),
            Some("none of no-such-helper-abc, no-such-helper-def found")
        );
    }

    #[test]
    fn test_default_commands() {
        let system = CommandListProbe::system();
        assert_eq!(system.candidates[0], vec!["checkupdates"]);
        assert_eq!(system.candidates[1], vec!["pacman", "-Qu"]);
        assert_eq!(CommandListProbe::aur().candidates.len(), 2);
        assert_eq!(CommandListProbe::flatpak().source(), PackageSource::Flatpak);
    }
}
