//! Maps changed file paths to deployable-unit names.

use testbed_core::UnitSet;
use testbed_core::config::DetectConfig;

/// Decides which changed paths name a deployable unit.
///
/// A path contributes only if it lies under the manifest directory and ends
/// in a recognized extension. `<dir>/<unit>.<ext>` yields `<unit>`;
/// `<dir>/<unit>/<any>.<ext>` yields `<unit>` as well, mirroring the
/// directory form of manifest lookup at deploy time.
#[derive(Debug, Clone)]
pub struct UnitMatcher {
    dir: Vec<String>,
    extensions: Vec<String>,
}

impl UnitMatcher {
    pub fn new(manifest_dir: &str, extensions: &[String]) -> Self {
        Self {
            dir: components(manifest_dir),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &DetectConfig) -> Self {
        Self::new(&config.manifest_dir, &config.extensions)
    }

    /// The unit named by `path`, if any.
    pub fn unit_for(&self, path: &str) -> Option<String> {
        let parts = components(path);
        if parts.len() <= self.dir.len() || parts[..self.dir.len()] != self.dir[..] {
            return None;
        }

        let file = parts.last()?;
        let (stem, ext) = file.rsplit_once('.')?;
        if !self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
            return None;
        }

        let below = &parts[self.dir.len()..];
        let unit = if below.len() == 1 { stem } else { below[0].as_str() };
        if unit.is_empty() {
            return None;
        }
        Some(unit.to_string())
    }

    /// Distinct units named by `paths`.
    pub fn units<'a, I>(&self, paths: I) -> UnitSet
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths.into_iter().filter_map(|p| self.unit_for(p)).collect()
    }
}

/// Split a repo-relative path into components, ignoring `.` and empty
/// segments so `./a//b/` and `a/b` compare equal.
fn components(path: &str) -> Vec<String> {
    path.trim()
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> UnitMatcher {
        UnitMatcher::from_config(&DetectConfig::default())
    }

    #[test]
    fn readme_contributes_nothing() {
        let units = matcher().units(["scripts/testbed/feature-a.yaml", "README.md"]);
        let expected: UnitSet = ["feature-a"].into_iter().collect();
        assert_eq!(units, expected);
    }

    #[test]
    fn paths_outside_manifest_dir_never_match() {
        let m = matcher();
        assert_eq!(m.unit_for("services/feature-a.yaml"), None);
        assert_eq!(m.unit_for("scripts/feature-a.yaml"), None);
        assert_eq!(m.unit_for("scripts/testbed-old/feature-a.yaml"), None);
        assert_eq!(m.unit_for("other/scripts/testbed/feature-a.yaml"), None);
        assert_eq!(m.unit_for("scripts/testbed"), None);
    }

    #[test]
    fn unrecognized_extensions_are_ignored() {
        let m = matcher();
        assert_eq!(m.unit_for("scripts/testbed/notes.md"), None);
        assert_eq!(m.unit_for("scripts/testbed/Makefile"), None);
        assert_eq!(m.unit_for("scripts/testbed/.yaml"), None);
    }

    #[test]
    fn recognizes_all_configured_extensions() {
        let m = matcher();
        assert_eq!(m.unit_for("scripts/testbed/a.yml").as_deref(), Some("a"));
        assert_eq!(m.unit_for("scripts/testbed/b.json").as_deref(), Some("b"));
        assert_eq!(m.unit_for("scripts/testbed/c.YAML").as_deref(), Some("c"));
    }

    #[test]
    fn nested_paths_map_to_their_directory_unit() {
        let m = matcher();
        assert_eq!(
            m.unit_for("scripts/testbed/feature-b/deployment.yaml").as_deref(),
            Some("feature-b")
        );
        assert_eq!(
            m.unit_for("scripts/testbed/feature-b/overlays/ci/patch.yaml").as_deref(),
            Some("feature-b")
        );
    }

    #[test]
    fn stems_keep_inner_dots() {
        assert_eq!(
            matcher().unit_for("scripts/testbed/api.v2.yaml").as_deref(),
            Some("api.v2")
        );
    }

    #[test]
    fn tolerates_dot_prefix_and_trailing_slash() {
        let m = UnitMatcher::new("scripts/testbed/", &["yaml".to_string()]);
        assert_eq!(m.unit_for("./scripts/testbed/x.yaml").as_deref(), Some("x"));
    }

    #[test]
    fn duplicates_collapse() {
        let units = matcher().units([
            "scripts/testbed/a.yaml",
            "scripts/testbed/a/service.yaml",
            "scripts/testbed/a.json",
        ]);
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn empty_input_yields_empty_set() {
        assert!(matcher().units(std::iter::empty()).is_empty());
    }
}
