//! Storage inside the virtual cluster.
//!
//! Workloads that request a claim without naming a class need exactly one
//! default storage class. When the virtual cluster syncs no classes from the
//! parent, a local fallback class and a hostPath volume are created. A
//! claim of the configured minimum size is then issued and polled until
//! bound.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use testbed_core::config::StorageConfig;
use testbed_core::{CommandRunner, Kubectl};
use testbed_health::{PollOutcome, Poller};

use crate::report::{StorageOutcome, Warnings};

const STEP: &str = "storage";
const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";
const BETA_DEFAULT_CLASS_ANNOTATION: &str = "storageclass.beta.kubernetes.io/is-default-class";

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<Object>,
}

#[derive(Debug, Deserialize)]
struct Object {
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

/// A storage class as seen through `kubectl get storageclass -o json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClass {
    pub name: String,
    pub is_default: bool,
}

/// Parse a storage class list, sorted by name.
pub fn parse_storage_classes(json: &str) -> Result<Vec<StorageClass>, serde_json::Error> {
    let list: ObjectList = serde_json::from_str(json)?;
    let mut classes: Vec<StorageClass> = list
        .items
        .into_iter()
        .map(|item| {
            let flag = |key: &str| item.metadata.annotations.get(key).map(String::as_str) == Some("true");
            StorageClass {
                is_default: flag(DEFAULT_CLASS_ANNOTATION) || flag(BETA_DEFAULT_CLASS_ANNOTATION),
                name: item.metadata.name,
            }
        })
        .collect();
    classes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(classes)
}

/// Which classes must change so that exactly one is the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultPlan {
    pub keep: Option<String>,
    pub mark: Option<String>,
    pub unmark: Vec<String>,
}

/// Plan the default-class fix for `classes` (sorted by name). With none
/// marked the first becomes default; with several, all but the first lose it.
pub fn plan_default(classes: &[StorageClass]) -> DefaultPlan {
    let marked: Vec<&StorageClass> = classes.iter().filter(|c| c.is_default).collect();
    match marked.as_slice() {
        [] => DefaultPlan {
            keep: None,
            mark: classes.first().map(|c| c.name.clone()),
            unmark: Vec::new(),
        },
        [first, rest @ ..] => DefaultPlan {
            keep: Some(first.name.clone()),
            mark: None,
            unmark: rest.iter().map(|c| c.name.clone()).collect(),
        },
    }
}

/// Patch setting the default flag. Unmarking also drops the beta annotation,
/// which Kubernetes still honors on its own.
fn default_patch(value: bool) -> Value {
    let mut annotations = json!({ DEFAULT_CLASS_ANNOTATION: value.to_string() });
    if !value {
        annotations[BETA_DEFAULT_CLASS_ANNOTATION] = Value::Null;
    }
    json!({ "metadata": { "annotations": annotations } })
}

pub struct StorageSync<'a, R: ?Sized> {
    runner: &'a R,
    kubectl: &'a Kubectl,
    config: &'a StorageConfig,
    instance: &'a str,
}

impl<'a, R: CommandRunner + ?Sized> StorageSync<'a, R> {
    /// `kubectl` must address the virtual cluster.
    pub fn new(runner: &'a R, kubectl: &'a Kubectl, config: &'a StorageConfig, instance: &'a str) -> Self {
        Self {
            runner,
            kubectl,
            config,
            instance,
        }
    }

    /// Returns `None` when the storage classes could not be listed.
    pub async fn sync(&self, warnings: &mut Warnings) -> Option<StorageOutcome> {
        let classes = match self.list_classes().await {
            Ok(classes) => classes,
            Err(e) => {
                warnings.push(STEP, format!("listing storage classes failed: {e}"));
                return None;
            }
        };
        let mut outcome = StorageOutcome {
            classes_found: classes.len(),
            ..Default::default()
        };

        if classes.is_empty() {
            match self.apply(&self.fallback_objects()).await {
                Ok(()) => {
                    info!(class = %self.config.fallback_class, "created fallback storage class");
                    outcome.fallback_created = true;
                    outcome.default_class = Some(self.config.fallback_class.clone());
                }
                Err(e) => {
                    warnings.push(STEP, format!("creating fallback storage failed: {e}"));
                    return Some(outcome);
                }
            }
        } else {
            outcome.default_class = self.normalize_default(&classes, warnings).await;
        }

        match self.apply(&self.claim_object(outcome.default_class.as_deref())).await {
            Ok(()) => outcome.claim_requested = true,
            Err(e) => {
                warnings.push(STEP, format!("claim {} failed: {e}", self.config.claim_name));
                return Some(outcome);
            }
        }

        outcome.claim_bound = self.wait_bound().await;
        if !outcome.claim_bound {
            warnings.push(
                STEP,
                format!(
                    "claim {}/{} not bound after {} attempts",
                    self.config.claim_namespace, self.config.claim_name, self.config.bind_retries
                ),
            );
        }
        Some(outcome)
    }

    async fn list_classes(&self) -> Result<Vec<StorageClass>, String> {
        let inv = self.kubectl.command(["get", "storageclass", "-o", "json"]);
        let out = self.runner.run(&inv).await.map_err(|e| e.to_string())?;
        if !out.success() {
            return Err(out.diagnostic());
        }
        parse_storage_classes(&out.stdout).map_err(|e| format!("unreadable storage class list: {e}"))
    }

    async fn normalize_default(&self, classes: &[StorageClass], warnings: &mut Warnings) -> Option<String> {
        let plan = plan_default(classes);
        for name in &plan.unmark {
            if let Err(e) = self.set_default(name, false).await {
                warnings.push(STEP, format!("unmarking default class {name} failed: {e}"));
            }
        }
        match (plan.keep, plan.mark) {
            (Some(keep), _) => {
                debug!(class = %keep, "default storage class present");
                Some(keep)
            }
            (None, Some(mark)) => match self.set_default(&mark, true).await {
                Ok(()) => {
                    info!(class = %mark, "marked storage class as default");
                    Some(mark)
                }
                Err(e) => {
                    warnings.push(STEP, format!("marking default class {mark} failed: {e}"));
                    None
                }
            },
            (None, None) => None,
        }
    }

    async fn set_default(&self, name: &str, value: bool) -> Result<(), String> {
        let patch = default_patch(value).to_string();
        let inv = self
            .kubectl
            .command(["patch", "storageclass", name, "-p", patch.as_str()]);
        let out = self.runner.run(&inv).await.map_err(|e| e.to_string())?;
        if out.success() {
            Ok(())
        } else {
            Err(out.diagnostic())
        }
    }

    async fn apply(&self, objects: &Value) -> Result<(), String> {
        let inv = self
            .kubectl
            .command(["apply", "-f", "-"])
            .stdin(objects.to_string());
        let out = self.runner.run(&inv).await.map_err(|e| e.to_string())?;
        if out.success() {
            Ok(())
        } else {
            Err(out.diagnostic())
        }
    }

    fn fallback_objects(&self) -> Value {
        let class = &self.config.fallback_class;
        json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {
                    "apiVersion": "storage.k8s.io/v1",
                    "kind": "StorageClass",
                    "metadata": {
                        "name": class,
                        "annotations": { DEFAULT_CLASS_ANNOTATION: "true" }
                    },
                    "provisioner": "kubernetes.io/no-provisioner",
                    "volumeBindingMode": "Immediate",
                    "reclaimPolicy": "Retain"
                },
                {
                    "apiVersion": "v1",
                    "kind": "PersistentVolume",
                    "metadata": { "name": format!("{class}-{}", self.instance) },
                    "spec": {
                        "capacity": { "storage": self.config.min_size },
                        "accessModes": ["ReadWriteOnce"],
                        "persistentVolumeReclaimPolicy": "Retain",
                        "storageClassName": class,
                        "hostPath": {
                            "path": format!("{}/{}", self.config.host_path_root.trim_end_matches('/'), self.instance),
                            "type": "DirectoryOrCreate"
                        }
                    }
                }
            ]
        })
    }

    fn claim_object(&self, class: Option<&str>) -> Value {
        let mut claim = json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {
                "name": self.config.claim_name,
                "namespace": self.config.claim_namespace
            },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": self.config.min_size } }
            }
        });
        if let Some(class) = class {
            claim["spec"]["storageClassName"] = json!(class);
        }
        claim
    }

    async fn wait_bound(&self) -> bool {
        let poller = Poller::new(
            self.config.bind_retries,
            Duration::from_secs(self.config.bind_interval_secs),
        );
        let inv = self.kubectl.command([
            "get",
            "pvc",
            self.config.claim_name.as_str(),
            "-n",
            self.config.claim_namespace.as_str(),
            "-o",
            "jsonpath={.status.phase}",
        ]);
        let result = poller
            .poll(|_| {
                let inv = &inv;
                async move {
                    match self.runner.run(inv).await {
                        Ok(out) if out.success() && out.stdout.trim() == "Bound" => PollOutcome::Ready,
                        _ => PollOutcome::Pending,
                    }
                }
            })
            .await;
        if result.is_ready() {
            info!(claim = %self.config.claim_name, attempts = result.attempts(), "claim bound");
        }
        result.is_ready()
    }
}
