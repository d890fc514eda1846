//! Git-driven change detection.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use testbed_core::{CommandRunner, Invocation, UnitSet};

use crate::error::DetectError;
use crate::matcher::UnitMatcher;

/// Outcome of one detection run.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    /// Commit (or, on fallback, the target ref) the diff was taken against.
    pub base: String,
    pub revision: String,
    pub changed_paths: Vec<String>,
    pub units: UnitSet,
}

pub struct ChangeDetector<'a, R: ?Sized> {
    runner: &'a R,
    matcher: UnitMatcher,
    repo: Option<PathBuf>,
}

impl<'a, R: CommandRunner + ?Sized> ChangeDetector<'a, R> {
    pub fn new(runner: &'a R, matcher: UnitMatcher) -> Self {
        Self {
            runner,
            matcher,
            repo: None,
        }
    }

    /// Run git in `repo` instead of the current directory.
    pub fn in_repo(mut self, repo: impl Into<PathBuf>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    fn git<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inv = Invocation::new("git");
        if let Some(repo) = &self.repo {
            inv = inv.arg("-C").arg(repo.display().to_string());
        }
        inv.args(args)
    }

    /// Nearest common ancestor of `target_ref` and `revision`, or
    /// `target_ref` itself when history is too shallow to find one.
    pub async fn resolve_base(&self, target_ref: &str, revision: &str) -> String {
        let inv = self.git(["merge-base", target_ref, revision]);
        match self.runner.run(&inv).await {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
                let base = out.stdout.trim().to_string();
                debug!(%base, %target_ref, "resolved merge base");
                base
            }
            Ok(out) => {
                warn!(
                    %target_ref,
                    error = %out.diagnostic(),
                    "no common ancestor found, diffing against target ref"
                );
                target_ref.to_string()
            }
            Err(e) => {
                warn!(%target_ref, error = %e, "merge-base failed, diffing against target ref");
                target_ref.to_string()
            }
        }
    }

    /// Compute the affected-unit set for `revision` relative to `target_ref`.
    pub async fn detect(&self, target_ref: &str, revision: &str) -> Result<Detection, DetectError> {
        let base = self.resolve_base(target_ref, revision).await;

        // NUL-separated output keeps non-ASCII paths unquoted.
        let inv = self.git(["diff", "--name-only", "-z", "--no-renames", base.as_str(), revision]);
        let out = self.runner.run(&inv).await?;
        if !out.success() {
            return Err(DetectError::Diff {
                base,
                revision: revision.to_string(),
                message: out.diagnostic(),
            });
        }

        let changed_paths: Vec<String> = out
            .stdout
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        let units = self.matcher.units(changed_paths.iter().map(String::as_str));

        if units.is_empty() {
            info!(changed = changed_paths.len(), "no deployable units changed");
        } else {
            info!(changed = changed_paths.len(), %units, "affected units detected");
        }

        Ok(Detection {
            base,
            revision: revision.to_string(),
            changed_paths,
            units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbed_core::CommandOutput;
    use testbed_core::config::DetectConfig;
    use testbed_test_utils::ScriptedRunner;

    fn detector(runner: &ScriptedRunner) -> ChangeDetector<'_, ScriptedRunner> {
        ChangeDetector::new(runner, UnitMatcher::from_config(&DetectConfig::default()))
    }

    #[tokio::test]
    async fn diffs_against_merge_base() {
        let runner = ScriptedRunner::new();
        runner.on(&["git", "merge-base"], CommandOutput::ok("abc123\n"));
        runner.on(
            &["git", "diff"],
            CommandOutput::ok("scripts/testbed/feature-a.yaml\0README.md\0"),
        );

        let detection = detector(&runner).detect("origin/main", "HEAD").await.unwrap();
        assert_eq!(detection.base, "abc123");
        assert_eq!(detection.changed_paths.len(), 2);
        assert_eq!(detection.units.to_string(), "feature-a");
        assert!(runner.was_called(&["git", "diff", "--name-only", "abc123", "HEAD"]));
    }

    #[tokio::test]
    async fn shallow_history_falls_back_to_target_ref() {
        let runner = ScriptedRunner::new();
        runner.on(
            &["git", "merge-base"],
            CommandOutput::failed(1, "fatal: Not a valid object name origin/main"),
        );
        runner.on(&["git", "diff"], CommandOutput::ok("scripts/testbed/b.yml\0"));

        let detection = detector(&runner).detect("origin/main", "HEAD").await.unwrap();
        assert_eq!(detection.base, "origin/main");
        assert!(runner.was_called(&["git", "diff", "origin/main", "HEAD"]));
        assert!(detection.units.contains("b"));
    }

    #[tokio::test]
    async fn non_ascii_paths_are_kept_verbatim() {
        let runner = ScriptedRunner::new();
        runner.on(&["git", "merge-base"], CommandOutput::ok("abc123\n"));
        runner.on(
            &["git", "diff"],
            CommandOutput::ok("scripts/testbed/café.yaml\0scripts/testbed/my app.yaml\0"),
        );

        let detection = detector(&runner).detect("origin/main", "HEAD").await.unwrap();
        assert!(runner.was_called(&["git", "diff", "--name-only", "-z"]));
        assert!(detection.units.contains("café"));
        assert!(detection.units.contains("my app"));
    }

    #[tokio::test]
    async fn empty_merge_base_output_falls_back() {
        let runner = ScriptedRunner::new();
        runner.on(&["git", "merge-base"], CommandOutput::ok("\n"));
        let detection = detector(&runner).detect("origin/main", "HEAD").await.unwrap();
        assert_eq!(detection.base, "origin/main");
        assert!(detection.units.is_empty());
    }

    #[tokio::test]
    async fn diff_failure_is_an_error() {
        let runner = ScriptedRunner::new();
        runner.on(&["git", "diff"], CommandOutput::failed(128, "fatal: bad revision"));
        let err = detector(&runner).detect("origin/main", "HEAD").await.unwrap_err();
        assert!(err.to_string().contains("bad revision"));
    }

    #[tokio::test]
    async fn runs_git_in_repo_directory() {
        let runner = ScriptedRunner::new();
        detector(&runner)
            .in_repo("/work/repo")
            .detect("origin/main", "HEAD")
            .await
            .unwrap();
        assert!(runner.was_called(&["git", "-C", "/work/repo", "merge-base"]));
    }
}
