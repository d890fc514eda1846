//! A stateful stand-in for `kubectl` and `vcluster`.
//!
//! Understands exactly the invocations the testbed crates issue and keeps
//! enough state (namespaces, instances, leases, storage, applied units) to
//! check idempotence and ordering properties end to end. Any `kubectl` call
//! carrying `--kubeconfig` is treated as addressing the virtual cluster;
//! everything else addresses the parent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use testbed_core::exec::RunFuture;
use testbed_core::{CommandOutput, CommandRunner, ExecError, Invocation};

use crate::scripted::matches;

/// Kubeconfig handed out by `vcluster connect --print`.
pub const FAKE_KUBECONFIG: &str = "apiVersion: v1\nkind: Config\nclusters: []\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeInstance {
    pub namespace: String,
    pub name: String,
    /// Number of create-or-upgrade calls after the first create.
    pub upgrades: u32,
}

/// Observable and tweakable cluster state.
#[derive(Debug, Clone)]
pub struct ClusterState {
    pub reachable: bool,
    pub fail_instance_create: bool,
    /// Readiness probes that fail before the instance reports ready.
    pub readiness_failures: u32,
    pub claims_bind: bool,
    /// Rollout targets (`deployment.apps/x`) whose status check times out.
    pub failing_rollouts: BTreeSet<String>,

    pub namespaces: BTreeMap<String, BTreeMap<String, String>>,
    pub instances: BTreeMap<String, FakeInstance>,
    pub leases: BTreeMap<String, Value>,
    /// Storage classes inside the virtual cluster: name -> marked default.
    pub storage_classes: BTreeMap<String, bool>,
    /// Classes carrying the legacy beta default annotation.
    pub beta_default_classes: BTreeSet<String>,
    pub volumes: BTreeMap<String, Value>,
    pub claims: BTreeMap<String, Value>,
    /// Manifest paths applied inside the virtual cluster, in order.
    pub applied: Vec<String>,
    pub rollouts_checked: Vec<String>,
    lease_version: u64,
}

const DEFAULT_CLASS: &str = "storageclass.kubernetes.io/is-default-class";
const BETA_DEFAULT_CLASS: &str = "storageclass.beta.kubernetes.io/is-default-class";

impl ClusterState {
    /// Classes Kubernetes would treat as default: either annotation counts.
    pub fn default_classes(&self) -> Vec<String> {
        self.storage_classes
            .iter()
            .filter(|(name, ga)| **ga || self.beta_default_classes.contains(*name))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            reachable: true,
            fail_instance_create: false,
            readiness_failures: 0,
            claims_bind: true,
            failing_rollouts: BTreeSet::new(),
            namespaces: BTreeMap::new(),
            instances: BTreeMap::new(),
            leases: BTreeMap::new(),
            storage_classes: BTreeMap::new(),
            beta_default_classes: BTreeSet::new(),
            volumes: BTreeMap::new(),
            claims: BTreeMap::new(),
            applied: Vec::new(),
            rollouts_checked: Vec::new(),
            lease_version: 0,
        }
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    calls: Mutex<Vec<Invocation>>,
}

/// kubectl arguments with global flags split off.
struct KubectlArgs {
    kubeconfig: Option<String>,
    rest: Vec<String>,
}

impl KubectlArgs {
    fn parse(args: &[String]) -> Self {
        let mut kubeconfig = None;
        let mut rest = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--kubeconfig" => kubeconfig = iter.next().cloned(),
                "--context" => {
                    iter.next();
                }
                a if a.starts_with("--request-timeout=") => {}
                _ => rest.push(arg.clone()),
            }
        }
        Self { kubeconfig, rest }
    }

    fn positional(&self, index: usize) -> Option<&str> {
        self.rest
            .iter()
            .filter(|a| !a.starts_with('-'))
            .nth(index)
            .map(String::as_str)
    }

    fn flag(&self, names: &[&str]) -> Option<&str> {
        let mut iter = self.rest.iter();
        while let Some(arg) = iter.next() {
            if names.contains(&arg.as_str()) {
                return iter.next().map(String::as_str);
            }
            for name in names {
                if let Some(value) = arg.strip_prefix(&format!("{name}=")) {
                    return Some(value);
                }
            }
        }
        None
    }

    fn has(&self, flag: &str) -> bool {
        self.rest.iter().any(|a| a == flag)
    }
}

fn not_found(kind: &str, name: &str) -> CommandOutput {
    CommandOutput::failed(
        1,
        format!(r#"Error from server (NotFound): {kind} "{name}" not found"#),
    )
}

fn already_exists(kind: &str, name: &str) -> CommandOutput {
    CommandOutput::failed(
        1,
        format!(r#"Error from server (AlreadyExists): {kind} "{name}" already exists"#),
    )
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjust state before (or between) runs.
    pub fn with<F: FnOnce(&mut ClusterState)>(&self, f: F) -> &Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn state(&self) -> ClusterState {
        self.state.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &[&str]) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| matches(inv, pattern))
            .count()
    }

    fn handle(&self, inv: &Invocation) -> CommandOutput {
        self.calls.lock().unwrap().push(inv.clone());
        let mut state = self.state.lock().unwrap();
        match inv.program.as_str() {
            "kubectl" => {
                let args = KubectlArgs::parse(&inv.args);
                if !state.reachable && args.kubeconfig.is_none() {
                    return CommandOutput::failed(
                        1,
                        "The connection to the server 127.0.0.1:6443 was refused",
                    );
                }
                if args.kubeconfig.is_some() {
                    virtual_kubectl(&mut state, &args, inv.stdin.as_deref())
                } else {
                    parent_kubectl(&mut state, &args, inv.stdin.as_deref())
                }
            }
            "vcluster" => vcluster(&mut state, &KubectlArgs::parse(&inv.args)),
            _ => CommandOutput::ok(""),
        }
    }
}

impl CommandRunner for FakeCluster {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a> {
        let out: Result<CommandOutput, ExecError> = Ok(self.handle(invocation));
        Box::pin(async move { out })
    }
}

fn parent_kubectl(state: &mut ClusterState, args: &KubectlArgs, stdin: Option<&str>) -> CommandOutput {
    let verb = args.positional(0).unwrap_or_default();
    let kind = args.positional(1).unwrap_or_default();
    let name = args.positional(2).unwrap_or_default();
    let ns = args.flag(&["-n", "--namespace"]).unwrap_or("default").to_string();

    match (verb, kind) {
        ("version", _) => CommandOutput::ok("Client Version: v1.30.0\nServer Version: v1.30.0\n"),
        ("get", "namespace") => {
            if state.namespaces.contains_key(name) {
                CommandOutput::ok(format!("namespace/{name}\n"))
            } else {
                not_found("namespaces", name)
            }
        }
        ("create", "namespace") => {
            if state.namespaces.contains_key(name) {
                already_exists("namespaces", name)
            } else {
                state.namespaces.insert(name.to_string(), BTreeMap::new());
                CommandOutput::ok(format!("namespace/{name} created\n"))
            }
        }
        ("label", "namespace") => {
            let Some(labels) = state.namespaces.get_mut(name) else {
                return not_found("namespaces", name);
            };
            for pair in args.rest.iter().filter(|a| a.contains('=') && !a.starts_with('-')) {
                if let Some((k, v)) = pair.split_once('=') {
                    labels.insert(k.to_string(), v.to_string());
                }
            }
            CommandOutput::ok(format!("namespace/{name} labeled\n"))
        }
        ("delete", "namespace") => {
            if state.namespaces.remove(name).is_none() && !args.has("--ignore-not-found") {
                return not_found("namespaces", name);
            }
            state.instances.retain(|_, inst| inst.namespace != name);
            state.leases.remove(name);
            CommandOutput::ok("")
        }
        ("get", "daemonset") => CommandOutput::ok(format!("daemonset.apps/{name}\n")),
        ("apply", _) => CommandOutput::ok(""),
        ("create", _) if args.flag(&["-f"]) == Some("-") => {
            create_lease(state, stdin.unwrap_or_default())
        }
        ("replace", _) if args.flag(&["-f"]) == Some("-") => {
            replace_lease(state, stdin.unwrap_or_default())
        }
        ("get", "lease") => match state.leases.get(&ns) {
            Some(lease) => CommandOutput::ok(lease.to_string()),
            None => not_found("leases.coordination.k8s.io", name),
        },
        ("delete", "lease") => {
            if state.leases.remove(&ns).is_none() && !args.has("--ignore-not-found") {
                return not_found("leases.coordination.k8s.io", name);
            }
            CommandOutput::ok("")
        }
        ("get", "secret") => {
            let instance = name.strip_prefix("vc-").unwrap_or(name);
            if state.instances.contains_key(&format!("{ns}/{instance}")) {
                CommandOutput::ok(STANDARD.encode(FAKE_KUBECONFIG))
            } else {
                not_found("secrets", name)
            }
        }
        _ => CommandOutput::failed(1, format!("fake kubectl: unsupported {:?}", args.rest)),
    }
}

fn create_lease(state: &mut ClusterState, manifest: &str) -> CommandOutput {
    let Ok(mut lease) = serde_json::from_str::<Value>(manifest) else {
        return CommandOutput::failed(1, "error: unable to decode lease manifest");
    };
    let ns = lease["metadata"]["namespace"].as_str().unwrap_or("default").to_string();
    let name = lease["metadata"]["name"].as_str().unwrap_or_default().to_string();
    if !state.namespaces.contains_key(&ns) {
        return not_found("namespaces", &ns);
    }
    if state.leases.contains_key(&ns) {
        return already_exists("leases.coordination.k8s.io", &name);
    }
    state.lease_version += 1;
    lease["metadata"]["resourceVersion"] = json!(state.lease_version.to_string());
    state.leases.insert(ns, lease.clone());
    CommandOutput::ok(lease.to_string())
}

fn replace_lease(state: &mut ClusterState, manifest: &str) -> CommandOutput {
    let Ok(mut lease) = serde_json::from_str::<Value>(manifest) else {
        return CommandOutput::failed(1, "error: unable to decode lease manifest");
    };
    let ns = lease["metadata"]["namespace"].as_str().unwrap_or("default").to_string();
    let name = lease["metadata"]["name"].as_str().unwrap_or_default().to_string();
    let Some(current) = state.leases.get(&ns) else {
        return not_found("leases.coordination.k8s.io", &name);
    };
    if current["metadata"]["resourceVersion"] != lease["metadata"]["resourceVersion"] {
        return CommandOutput::failed(
            1,
            "Error from server (Conflict): the object has been modified",
        );
    }
    state.lease_version += 1;
    lease["metadata"]["resourceVersion"] = json!(state.lease_version.to_string());
    state.leases.insert(ns, lease.clone());
    CommandOutput::ok(lease.to_string())
}

fn vcluster(state: &mut ClusterState, args: &KubectlArgs) -> CommandOutput {
    if !state.reachable {
        return CommandOutput::failed(1, "fatal: couldn't reach the cluster");
    }
    let verb = args.positional(0).unwrap_or_default();
    let name = args.positional(1).unwrap_or_default().to_string();
    let ns = args.flag(&["-n", "--namespace"]).unwrap_or("default").to_string();
    let key = format!("{ns}/{name}");

    match verb {
        "create" => {
            if state.fail_instance_create {
                return CommandOutput::failed(1, "fatal: helm upgrade failed: timed out");
            }
            if !state.namespaces.contains_key(&ns) {
                return CommandOutput::failed(1, format!("fatal: namespace {ns} not found"));
            }
            match state.instances.get_mut(&key) {
                Some(existing) if args.has("--upgrade") => existing.upgrades += 1,
                Some(_) => {
                    return CommandOutput::failed(1, format!("fatal: vcluster {name} already exists"));
                }
                None => {
                    state.instances.insert(
                        key,
                        FakeInstance {
                            namespace: ns,
                            name: name.clone(),
                            upgrades: 0,
                        },
                    );
                }
            }
            CommandOutput::ok(format!("done: vcluster {name} is ready\n"))
        }
        "connect" => {
            if state.instances.contains_key(&key) && args.has("--print") {
                CommandOutput::ok(FAKE_KUBECONFIG)
            } else {
                CommandOutput::failed(1, format!("fatal: couldn't find vcluster {name}"))
            }
        }
        "delete" => {
            if state.instances.remove(&key).is_some() {
                CommandOutput::ok(format!("done: deleted vcluster {name}\n"))
            } else {
                CommandOutput::failed(1, format!("fatal: couldn't find vcluster {name}"))
            }
        }
        _ => CommandOutput::failed(1, format!("fatal: unsupported vcluster {verb}")),
    }
}

fn virtual_kubectl(state: &mut ClusterState, args: &KubectlArgs, stdin: Option<&str>) -> CommandOutput {
    let verb = args.positional(0).unwrap_or_default();
    let kind = args.positional(1).unwrap_or_default();
    let name = args.positional(2).unwrap_or_default().to_string();
    let ns = args.flag(&["-n", "--namespace"]).unwrap_or("default").to_string();

    match verb {
        "get" if args.has("--raw") || args.flag(&["--raw"]).is_some() => {
            if state.readiness_failures > 0 {
                state.readiness_failures -= 1;
                CommandOutput::failed(1, "Error from server (ServiceUnavailable)")
            } else {
                CommandOutput::ok("ok")
            }
        }
        "get" if kind == "storageclass" => {
            let items: Vec<Value> = state
                .storage_classes
                .iter()
                .map(|(name, default)| {
                    let mut annotations = json!({ DEFAULT_CLASS: default.to_string() });
                    if state.beta_default_classes.contains(name) {
                        annotations[BETA_DEFAULT_CLASS] = json!("true");
                    }
                    json!({ "metadata": { "name": name, "annotations": annotations } })
                })
                .collect();
            CommandOutput::ok(json!({ "kind": "List", "items": items }).to_string())
        }
        "get" if kind == "pvc" => {
            let bound = state.claims_bind
                && (!state.volumes.is_empty() || !state.default_classes().is_empty());
            match state.claims.get(&format!("{ns}/{name}")) {
                Some(_) if bound => CommandOutput::ok("Bound"),
                Some(_) => CommandOutput::ok("Pending"),
                None => not_found("persistentvolumeclaims", &name),
            }
        }
        "patch" if kind == "storageclass" => {
            let Some(default) = state.storage_classes.get_mut(&name) else {
                return not_found("storageclasses.storage.k8s.io", &name);
            };
            let patch: Value = args
                .flag(&["-p"])
                .and_then(|p| serde_json::from_str(p).ok())
                .unwrap_or(Value::Null);
            let annotations = &patch["metadata"]["annotations"];
            if let Some(value) = annotations.get(DEFAULT_CLASS) {
                *default = value.as_str() == Some("true");
            }
            match annotations.get(BETA_DEFAULT_CLASS) {
                Some(Value::String(v)) if v == "true" => {
                    state.beta_default_classes.insert(name.clone());
                }
                Some(_) => {
                    state.beta_default_classes.remove(&name);
                }
                None => {}
            }
            CommandOutput::ok(format!("storageclass.storage.k8s.io/{name} patched\n"))
        }
        "apply" if args.flag(&["-f"]) == Some("-") => apply_objects(state, stdin.unwrap_or_default()),
        "apply" => {
            let path = args.flag(&["-f", "-k"]).unwrap_or_default().to_string();
            state.applied.push(path.clone());
            let stem = std::path::Path::new(&path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            CommandOutput::ok(format!("deployment.apps/{stem}\nservice/{stem}\n"))
        }
        "rollout" => {
            let target = args.positional(2).unwrap_or_default().to_string();
            state.rollouts_checked.push(target.clone());
            if state.failing_rollouts.contains(&target) {
                CommandOutput::failed(1, "error: timed out waiting for the condition")
            } else {
                CommandOutput::ok(format!("{target} successfully rolled out\n"))
            }
        }
        _ => CommandOutput::failed(1, format!("fake kubectl: unsupported {:?}", args.rest)),
    }
}

fn apply_objects(state: &mut ClusterState, manifest: &str) -> CommandOutput {
    let Ok(doc) = serde_json::from_str::<Value>(manifest) else {
        return CommandOutput::failed(1, "error: unable to decode manifest");
    };
    let items = match doc["kind"].as_str() {
        Some("List") => doc["items"].as_array().cloned().unwrap_or_default(),
        _ => vec![doc],
    };
    let mut out = String::new();
    for item in items {
        let name = item["metadata"]["name"].as_str().unwrap_or_default().to_string();
        match item["kind"].as_str() {
            Some("StorageClass") => {
                let default = item["metadata"]["annotations"][DEFAULT_CLASS].as_str() == Some("true");
                state.storage_classes.insert(name.clone(), default);
                out.push_str(&format!("storageclass.storage.k8s.io/{name} configured\n"));
            }
            Some("PersistentVolume") => {
                state.volumes.insert(name.clone(), item.clone());
                out.push_str(&format!("persistentvolume/{name} configured\n"));
            }
            Some("PersistentVolumeClaim") => {
                let ns = item["metadata"]["namespace"].as_str().unwrap_or("default");
                state.claims.insert(format!("{ns}/{name}"), item.clone());
                out.push_str(&format!("persistentvolumeclaim/{name} configured\n"));
            }
            other => {
                return CommandOutput::failed(1, format!("fake kubectl: cannot apply {other:?}"));
            }
        }
    }
    CommandOutput::ok(out)
}
