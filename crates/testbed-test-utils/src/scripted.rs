//! A command runner that answers from a script and records every call.

use std::collections::VecDeque;
use std::sync::Mutex;

use testbed_core::exec::RunFuture;
use testbed_core::{CommandOutput, CommandRunner, ExecError, Invocation};

enum Reply {
    Output(CommandOutput),
    SpawnError,
    Timeout,
}

struct Rule {
    pattern: Vec<String>,
    replies: VecDeque<Reply>,
}

/// Replies to invocations whose argv contains `pattern` as an ordered
/// subsequence. Later rules shadow earlier ones; a rule with several replies
/// hands them out in order and keeps repeating the last. Unmatched
/// invocations succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, pattern: &[&str], output: CommandOutput) -> &Self {
        self.push(pattern, vec![Reply::Output(output)])
    }

    pub fn on_sequence(&self, pattern: &[&str], outputs: Vec<CommandOutput>) -> &Self {
        self.push(pattern, outputs.into_iter().map(Reply::Output).collect())
    }

    /// Make matching invocations fail as if the binary were missing.
    pub fn on_spawn_error(&self, pattern: &[&str]) -> &Self {
        self.push(pattern, vec![Reply::SpawnError])
    }

    /// Make matching invocations fail as if their own timeout elapsed.
    pub fn on_timeout(&self, pattern: &[&str]) -> &Self {
        self.push(pattern, vec![Reply::Timeout])
    }

    fn push(&self, pattern: &[&str], replies: Vec<Reply>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.iter().map(|s| s.to_string()).collect(),
            replies: replies.into(),
        });
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls matching `pattern`.
    pub fn count(&self, pattern: &[&str]) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| matches(inv, pattern))
            .count()
    }

    pub fn was_called(&self, pattern: &[&str]) -> bool {
        self.count(pattern) > 0
    }

    fn reply(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        self.calls.lock().unwrap().push(invocation.clone());

        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().rev().find(|rule| {
            let pattern: Vec<&str> = rule.pattern.iter().map(String::as_str).collect();
            matches(invocation, &pattern)
        });
        let Some(rule) = rule else {
            return Ok(CommandOutput::ok(""));
        };

        let reply = if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().map(|r| match r {
                Reply::Output(out) => Reply::Output(out.clone()),
                Reply::SpawnError => Reply::SpawnError,
                Reply::Timeout => Reply::Timeout,
            })
        };

        match reply {
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::SpawnError) => Err(ExecError::Spawn {
                program: invocation.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            }),
            Some(Reply::Timeout) => Err(ExecError::Timeout {
                program: invocation.program.clone(),
                after: invocation.timeout.unwrap_or_default(),
            }),
            None => Ok(CommandOutput::ok("")),
        }
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunFuture<'a> {
        let result = self.reply(invocation);
        Box::pin(async move { result })
    }
}

/// Whether `pattern` is an ordered subsequence of the invocation's argv.
pub fn matches(invocation: &Invocation, pattern: &[&str]) -> bool {
    let mut argv = invocation.argv().into_iter();
    pattern.iter().all(|want| argv.any(|have| have == *want))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unmatched_calls_succeed_and_are_recorded() {
        let runner = ScriptedRunner::new();
        let out = runner.run(&Invocation::new("git").arg("status")).await.unwrap();
        assert!(out.success());
        assert_eq!(runner.count(&["git", "status"]), 1);
    }

    #[tokio::test]
    async fn later_rules_shadow_earlier_ones() {
        let runner = ScriptedRunner::new();
        runner.on(&["kubectl"], CommandOutput::ok("first"));
        runner.on(&["kubectl", "version"], CommandOutput::failed(1, "refused"));

        let version = Invocation::new("kubectl").arg("version");
        assert!(!runner.run(&version).await.unwrap().success());
        let other = Invocation::new("kubectl").arg("get");
        assert_eq!(runner.run(&other).await.unwrap().stdout, "first");
    }

    #[tokio::test]
    async fn sequence_repeats_last_reply() {
        let runner = ScriptedRunner::new();
        runner.on_sequence(
            &["probe"],
            vec![CommandOutput::failed(1, ""), CommandOutput::ok("ok")],
        );
        let inv = Invocation::new("probe");
        assert!(!runner.run(&inv).await.unwrap().success());
        assert!(runner.run(&inv).await.unwrap().success());
        assert!(runner.run(&inv).await.unwrap().success());
    }

    #[tokio::test]
    async fn spawn_errors_are_scripted() {
        let runner = ScriptedRunner::new();
        runner.on_spawn_error(&["vcluster"]);
        let err = runner.run(&Invocation::new("vcluster")).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn timeouts_are_scripted() {
        let runner = ScriptedRunner::new();
        runner.on_timeout(&["rollout"]);
        let err = runner
            .run(&Invocation::new("kubectl").arg("rollout"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[test]
    fn pattern_is_an_ordered_subsequence() {
        let inv = Invocation::new("kubectl").args(["--kubeconfig", "x", "get", "ns"]);
        assert!(matches(&inv, &["kubectl", "get", "ns"]));
        assert!(!matches(&inv, &["ns", "get"]));
    }
}
