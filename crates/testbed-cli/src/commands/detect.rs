use std::path::PathBuf;

use testbed_core::{CommandRunner, TestbedConfig};
use testbed_detect::{ChangeDetector, Detection, UnitMatcher};

#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    /// Overrides `detect.target_ref`.
    pub target_ref: Option<String>,
    pub revision: String,
    pub repo: Option<PathBuf>,
}

pub async fn detect<R: CommandRunner + ?Sized>(
    runner: &R,
    config: &TestbedConfig,
    opts: &DetectOptions,
) -> anyhow::Result<Detection> {
    let mut detector = ChangeDetector::new(runner, UnitMatcher::from_config(&config.detect));
    if let Some(repo) = &opts.repo {
        detector = detector.in_repo(repo.clone());
    }
    let target_ref = opts.target_ref.as_deref().unwrap_or(&config.detect.target_ref);
    Ok(detector.detect(target_ref, &opts.revision).await?)
}

/// Render a detection for stdout.
pub fn render(detection: &Detection, format: &str) -> anyhow::Result<String> {
    match format {
        "json" => Ok(serde_json::to_string_pretty(detection)?),
        _ => Ok(detection
            .units
            .iter()
            .map(|u| format!("{u}\n"))
            .collect()),
    }
}
