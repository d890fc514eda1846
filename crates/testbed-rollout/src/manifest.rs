//! Manifest lookup — unit name to the file or directory that deploys it.

use std::path::{Path, PathBuf};

use testbed_core::config::DeployConfig;

/// How a manifest is handed to `kubectl apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    File,
    /// Plain directory, applied recursively.
    Directory,
    /// Directory with a kustomization file.
    Kustomize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub path: PathBuf,
    pub kind: ManifestKind,
}

impl Manifest {
    /// Source arguments for `kubectl apply`.
    pub fn apply_args(&self) -> Vec<String> {
        let path = self.path.display().to_string();
        match self.kind {
            ManifestKind::File => vec!["-f".to_string(), path],
            ManifestKind::Directory => vec!["-f".to_string(), path, "-R".to_string()],
            ManifestKind::Kustomize => vec!["-k".to_string(), path],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestIndex {
    root: PathBuf,
    extensions: Vec<String>,
}

impl ManifestIndex {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            extensions: extensions.to_vec(),
        }
    }

    pub fn from_config(config: &DeployConfig) -> Self {
        Self::new(&config.manifest_root, &config.extensions)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<unit>.<ext>` for the first recognized extension, else the
    /// directory `<root>/<unit>/`.
    pub fn lookup(&self, unit: &str) -> Option<Manifest> {
        if unit.is_empty() || unit.contains('/') || unit == "." || unit == ".." {
            return None;
        }
        for ext in &self.extensions {
            let path = self.root.join(format!("{unit}.{ext}"));
            if path.is_file() {
                return Some(Manifest {
                    path,
                    kind: ManifestKind::File,
                });
            }
        }

        let dir = self.root.join(unit);
        if !dir.is_dir() {
            return None;
        }
        let kustomized = ["kustomization.yaml", "kustomization.yml", "Kustomization"]
            .iter()
            .any(|name| dir.join(name).is_file());
        Some(Manifest {
            path: dir,
            kind: if kustomized {
                ManifestKind::Kustomize
            } else {
                ManifestKind::Directory
            },
        })
    }
}
