//! Runtime settings for the vcnest daemon
//!
//! Everything here comes from environment variables so the daemon can be
//! reconfigured per deployment without a config file. `Settings::from_env`
//! applies the documented defaults for anything unset.

use std::env;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

/// Errors raised while assembling settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be a number: {1}")]
    InvalidNumber(&'static str, String),

    #[error("no agent credential: set AGENT_TOKEN or AGENT_WEB_USER/AGENT_WEB_PASS")]
    MissingAgentToken,
}

/// Settings consumed by the controllers and the agent transport
#[derive(Debug, Clone)]
pub struct Settings {
    /// Port the per-host helper agent listens on
    pub agent_port: u16,

    /// Static bearer credential for the agent channel (already base64 encoded)
    pub agent_token: String,

    /// Name of the helper script installed on every host
    pub helper_script: String,

    /// Name of the helper script's environment file
    pub helper_env: String,

    /// Local directory holding the helper script and env file for self-heal uploads
    pub helper_source_dir: String,

    /// Remote scratch directory the pipelines upload certs/configs into
    pub agent_tmp_path: String,

    /// Local path of the kubelet config shipped to joining nodes
    pub kubelet_config_path: String,

    /// Remote file name for the uploaded cluster kubeconfig
    pub kubelet_kubeconfig_name: String,

    /// Remote file name for the uploaded kubelet config
    pub kubelet_config_name: String,

    /// IP of a host-cluster master with a reachable agent (used during unjoin)
    pub host_master_node_ip: String,

    /// Maximum concurrent per-node pipelines within one reconcile
    pub node_task_concurrency: usize,

    /// Overall bound for the node ready wait, seconds
    pub node_ready_timeout_secs: u64,

    /// Interval between reconcile sweeps, seconds
    pub reconcile_interval_secs: u64,

    /// Label key stamped on nodes to reflect their pool state
    pub state_label_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_port: 5678,
            agent_token: String::new(),
            helper_script: "kubelet_node_helper.sh".to_string(),
            helper_env: "env.sh".to_string(),
            helper_source_dir: "/etc/vc-node-dir/".to_string(),
            agent_tmp_path: "/apps/conf/vcnest/tmp".to_string(),
            kubelet_config_path: "/etc/vc-node-dir/config.yaml".to_string(),
            kubelet_kubeconfig_name: "kubelet.conf".to_string(),
            kubelet_config_name: "config.yaml".to_string(),
            host_master_node_ip: String::new(),
            node_task_concurrency: 5,
            node_ready_timeout_secs: 60,
            reconcile_interval_secs: 15,
            state_label_key: "vcnest.io/state".to_string(),
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let agent_token = match env::var("AGENT_TOKEN") {
            Ok(token) if !token.is_empty() => token,
            _ => {
                let user = env::var("AGENT_WEB_USER").unwrap_or_default();
                let pass = env::var("AGENT_WEB_PASS").unwrap_or_default();
                if user.is_empty() || pass.is_empty() {
                    return Err(ConfigError::MissingAgentToken);
                }
                BASE64.encode(format!("{}:{}", user, pass))
            }
        };

        Ok(Self {
            agent_port: parse_or("AGENT_PORT", defaults.agent_port)?,
            agent_token,
            helper_script: string_or("AGENT_HELPER_SCRIPT", defaults.helper_script),
            helper_env: string_or("AGENT_HELPER_ENV", defaults.helper_env),
            helper_source_dir: string_or("AGENT_HELPER_SOURCE_DIR", defaults.helper_source_dir),
            agent_tmp_path: string_or("AGENT_TMP_PATH", defaults.agent_tmp_path),
            kubelet_config_path: string_or("KUBELET_CONFIG_PATH", defaults.kubelet_config_path),
            kubelet_kubeconfig_name: string_or(
                "KUBELET_KUBECONFIG_NAME",
                defaults.kubelet_kubeconfig_name,
            ),
            kubelet_config_name: string_or("KUBELET_CONFIG_NAME", defaults.kubelet_config_name),
            host_master_node_ip: string_or("HOST_MASTER_NODE_IP", defaults.host_master_node_ip),
            node_task_concurrency: parse_or(
                "NODE_TASK_CONCURRENCY",
                defaults.node_task_concurrency,
            )?,
            node_ready_timeout_secs: parse_or(
                "NODE_READY_TIMEOUT_SECS",
                defaults.node_ready_timeout_secs,
            )?,
            reconcile_interval_secs: parse_or(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            )?,
            state_label_key: string_or("STATE_LABEL_KEY", defaults.state_label_key),
        })
    }

    /// Local path of the helper script used for self-heal uploads
    pub fn helper_script_source(&self) -> String {
        join_dir(&self.helper_source_dir, &self.helper_script)
    }

    /// Local path of the helper env file used for self-heal uploads
    pub fn helper_env_source(&self) -> String {
        join_dir(&self.helper_source_dir, &self.helper_env)
    }
}

fn string_or(key: &str, default: String) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(key, v.clone())),
        _ => Ok(default),
    }
}

fn join_dir(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
