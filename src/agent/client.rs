//! High-level agent client with helper-script self-healing
//!
//! `AgentClient` wraps a raw [`AgentCall`] and adds the one recovery the
//! fleet actually needs: when the agent reports exit code 127 (the helper
//! script is missing on the host), re-install the script and its environment
//! file from the local copies and retry the operation exactly once.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;

use super::operation::Operation;
use super::transport::{AgentCall, AgentTarget, ExecOutcome};

/// Remote file path the self-heal upload targets: the agent resolves "."
/// against its own working directory, which is where it looks the script up.
const HELPER_INSTALL_PATH: &str = ".";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent call on {host} failed: {outcome}")]
    CallFailed { host: String, outcome: ExecOutcome },

    #[error("cannot read helper source {path}: {source}")]
    HelperSource {
        path: String,
        source: std::io::Error,
    },
}

impl AgentError {
    pub fn outcome(&self) -> Option<&ExecOutcome> {
        match self {
            AgentError::CallFailed { outcome, .. } => Some(outcome),
            AgentError::HelperSource { .. } => None,
        }
    }
}

/// Agent access for the pipelines; shared across every concurrent node task
pub struct AgentClient {
    call: Arc<dyn AgentCall>,
    agent_port: u16,
    token: String,
    helper_script: String,
    helper_env: String,
    helper_script_source: String,
    helper_env_source: String,
}

impl AgentClient {
    pub fn new(call: Arc<dyn AgentCall>, settings: &Settings) -> Self {
        Self {
            call,
            agent_port: settings.agent_port,
            token: settings.agent_token.clone(),
            helper_script: settings.helper_script.clone(),
            helper_env: settings.helper_env.clone(),
            helper_script_source: settings.helper_script_source(),
            helper_env_source: settings.helper_env_source(),
        }
    }

    fn target(&self, host: &str) -> AgentTarget {
        AgentTarget::new(host, self.agent_port, self.token.clone())
    }

    /// Run one operation against a host's agent, self-healing a missing
    /// helper script. Returns the final outcome; callers decide whether a
    /// failure is fatal.
    pub async fn execute(
        &self,
        host: &str,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> ExecOutcome {
        let target = self.target(host);
        let outcome = self.call.call(&target, op, cancel).await;

        if !outcome.command_not_found() {
            return outcome;
        }

        warn!(
            "helper script missing on {}, reinstalling before retry",
            host
        );
        if let Err(e) = self.install_helper(&target, cancel).await {
            warn!("helper reinstall on {} failed: {}", host, e);
            return outcome;
        }

        info!("helper script reinstalled on {}, retrying {}", host, op.describe());
        self.call.call(&target, op, cancel).await
    }

    /// Like [`execute`](Self::execute) but maps failure to an error
    pub async fn run(
        &self,
        host: &str,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, AgentError> {
        let outcome = self.execute(host, op, cancel).await;
        if outcome.success() {
            Ok(outcome)
        } else {
            Err(AgentError::CallFailed {
                host: host.to_string(),
                outcome,
            })
        }
    }

    /// Upload a file into the agent's scratch area
    pub async fn upload(
        &self,
        host: &str,
        file_name: &str,
        file_path: &str,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, AgentError> {
        let op = Operation::upload(file_name, file_path, data);
        self.run(host, &op, cancel).await
    }

    /// Probe whether a TCP port is free on the host
    pub async fn check_port_free(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> bool {
        let op = Operation::check_port(port);
        self.execute(host, &op, cancel).await.success()
    }

    /// Push the helper script and its env file from the local source copies.
    /// Both uploads must succeed for the install to count.
    async fn install_helper(
        &self,
        target: &AgentTarget,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let script = read_source(&self.helper_script_source).await?;
        let env = read_source(&self.helper_env_source).await?;

        for (name, data) in [(&self.helper_script, script), (&self.helper_env, env)] {
            let op = Operation::upload(name.clone(), HELPER_INSTALL_PATH, data);
            let outcome = self.call.call(target, &op, cancel).await;
            if !outcome.success() {
                return Err(AgentError::CallFailed {
                    host: target.host.clone(),
                    outcome,
                });
            }
        }
        Ok(())
    }
}

async fn read_source(path: &str) -> Result<Vec<u8>, AgentError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| AgentError::HelperSource {
            path: path.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::transport::ExecStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted transport: pops one canned outcome per call and records what
    /// it was asked to do.
    struct ScriptedCall {
        outcomes: Mutex<Vec<ExecOutcome>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedCall {
        fn new(mut outcomes: Vec<ExecOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentCall for ScriptedCall {
        async fn call(
            &self,
            _target: &AgentTarget,
            op: &Operation,
            _cancel: &CancellationToken,
        ) -> ExecOutcome {
            self.calls.lock().unwrap().push(op.describe());
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| ExecOutcome::failed("script exhausted"))
        }
    }

    fn settings_with_sources(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.agent_token = "dG9rZW4=".to_string();
        settings.helper_source_dir = dir.to_str().unwrap().to_string();
        settings
    }

    fn success() -> ExecOutcome {
        ExecOutcome::from_close("0".to_string(), String::new())
    }

    fn not_found() -> ExecOutcome {
        ExecOutcome::from_close("127".to_string(), String::new())
    }

    #[tokio::test]
    async fn test_success_passes_through_without_heal() {
        let call = Arc::new(ScriptedCall::new(vec![success()]));
        let client = AgentClient::new(call.clone(), &settings_with_sources("/nonexistent".as_ref()));

        let op = Operation::command("bash").arg("kubelet_node_helper.sh").arg("check");
        let outcome = client.execute("10.0.0.1", &op, &CancellationToken::new()).await;

        assert!(outcome.success());
        assert_eq!(call.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_self_heal_uploads_then_retries_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kubelet_node_helper.sh"), b"#!/bin/bash\n").unwrap();
        std::fs::write(dir.path().join("env.sh"), b"export A=1\n").unwrap();

        // 127, two upload successes, then the retried command succeeds.
        let call = Arc::new(ScriptedCall::new(vec![
            not_found(),
            success(),
            success(),
            success(),
        ]));
        let client = AgentClient::new(call.clone(), &settings_with_sources(dir.path()));

        let op = Operation::command("bash").arg("kubelet_node_helper.sh").arg("join");
        let outcome = client.execute("10.0.0.1", &op, &CancellationToken::new()).await;

        assert!(outcome.success());
        let recorded = call.recorded();
        assert_eq!(recorded.len(), 4);
        assert!(recorded[1].starts_with("upload ./kubelet_node_helper.sh"));
        assert!(recorded[2].starts_with("upload ./env.sh"));
        assert_eq!(recorded[3], recorded[0]);
    }

    #[tokio::test]
    async fn test_failed_heal_returns_original_outcome() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kubelet_node_helper.sh"), b"#!/bin/bash\n").unwrap();
        std::fs::write(dir.path().join("env.sh"), b"export A=1\n").unwrap();

        // Script upload fails; the original 127 must come back untouched.
        let call = Arc::new(ScriptedCall::new(vec![
            not_found(),
            ExecOutcome::failed("upload rejected"),
        ]));
        let client = AgentClient::new(call.clone(), &settings_with_sources(dir.path()));

        let op = Operation::command("bash").arg("kubelet_node_helper.sh").arg("join");
        let outcome = client.execute("10.0.0.1", &op, &CancellationToken::new()).await;

        assert!(outcome.command_not_found());
        assert_eq!(call.recorded().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_local_source_skips_heal() {
        let call = Arc::new(ScriptedCall::new(vec![not_found()]));
        let client = AgentClient::new(call.clone(), &settings_with_sources("/nonexistent".as_ref()));

        let op = Operation::command("bash").arg("kubelet_node_helper.sh").arg("join");
        let outcome = client.execute("10.0.0.1", &op, &CancellationToken::new()).await;

        // No upload attempts were possible; the 127 stands.
        assert!(outcome.command_not_found());
        assert_eq!(call.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_plain_failure_is_not_healed() {
        let call = Arc::new(ScriptedCall::new(vec![ExecOutcome::from_close(
            "1".to_string(),
            "boom".to_string(),
        )]));
        let client = AgentClient::new(call.clone(), &settings_with_sources("/nonexistent".as_ref()));

        let op = Operation::command("bash").arg("kubelet_node_helper.sh").arg("join");
        let outcome = client.execute("10.0.0.1", &op, &CancellationToken::new()).await;

        assert_eq!(outcome.status, ExecStatus::Failed);
        assert_eq!(call.recorded().len(), 1);
    }
}
