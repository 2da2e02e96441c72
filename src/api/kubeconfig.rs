//! Minimal kubeconfig decoding
//!
//! A VirtualCluster embeds the kubeconfig for its own API server as a base64
//! string. Only the fields needed to reach that API are modeled: server URL,
//! bearer token, and the insecure-skip-verify flag.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubeconfigError {
    #[error("kubeconfig is empty")]
    Empty,

    #[error("kubeconfig is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("kubeconfig is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("kubeconfig has no clusters")]
    NoCluster,
}

#[derive(Debug, Deserialize)]
struct RawKubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    #[allow(dead_code)]
    name: String,
    cluster: RawCluster,
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    server: String,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    #[allow(dead_code)]
    name: String,
    #[serde(default)]
    user: RawUser,
}

#[derive(Debug, Deserialize, Default)]
struct RawUser {
    #[serde(default)]
    token: Option<String>,
}

/// The connection parameters extracted from an embedded kubeconfig
#[derive(Debug, Clone)]
pub struct Kubeconfig {
    /// API server base URL, e.g. `https://10.0.0.10:6443`
    pub server: String,

    /// Bearer token, if the kubeconfig carries one
    pub token: Option<String>,

    /// Skip TLS verification when talking to the API server
    pub insecure_skip_tls_verify: bool,
}

impl Kubeconfig {
    /// Decode a base64-embedded kubeconfig into connection parameters
    pub fn from_base64(encoded: &str) -> Result<Self, KubeconfigError> {
        if encoded.is_empty() {
            return Err(KubeconfigError::Empty);
        }
        let bytes = BASE64.decode(encoded.trim())?;
        let raw: RawKubeconfig = serde_yaml::from_slice(&bytes)?;

        let cluster = raw
            .clusters
            .into_iter()
            .next()
            .ok_or(KubeconfigError::NoCluster)?;

        let token = raw.users.into_iter().next().and_then(|u| u.user.token);

        Ok(Self {
            server: cluster.cluster.server.trim_end_matches('/').to_string(),
            token,
            insecure_skip_tls_verify: cluster.cluster.insecure_skip_tls_verify,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(yaml: &str) -> String {
        BASE64.encode(yaml)
    }

    #[test]
    fn test_decode_minimal_kubeconfig() {
        let yaml = r#"
apiVersion: v1
kind: Config
clusters:
  - name: tenant-a
    cluster:
      server: https://10.1.2.3:6443/
      insecure-skip-tls-verify: true
users:
  - name: admin
    user:
      token: abc123
"#;
        let cfg = Kubeconfig::from_base64(&encode(yaml)).unwrap();
        assert_eq!(cfg.server, "https://10.1.2.3:6443");
        assert_eq!(cfg.token.as_deref(), Some("abc123"));
        assert!(cfg.insecure_skip_tls_verify);
    }

    #[test]
    fn test_empty_kubeconfig_rejected() {
        assert!(matches!(
            Kubeconfig::from_base64(""),
            Err(KubeconfigError::Empty)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Kubeconfig::from_base64("not-base64!!").is_err());
    }

    #[test]
    fn test_no_clusters_rejected() {
        let yaml = "apiVersion: v1\nkind: Config\n";
        assert!(matches!(
            Kubeconfig::from_base64(&encode(yaml)),
            Err(KubeconfigError::NoCluster)
        ));
    }
}
