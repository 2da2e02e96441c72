//! Wire encoding for helper-agent operations
//!
//! The agent exposes three paths over its WebSocket endpoint:
//!
//! - `cmd/`    query `command` plus repeated `args` — run one command
//! - `upload/` query `file_name`, `file_path` — receive a chunked file
//! - `check/`  query `port` — probe whether a TCP port is free
//!
//! Uploads stream the payload as fixed-size binary frames terminated by a
//! text `"EOF"` marker. This encoding is a wire contract shared with every
//! deployed agent; do not change it without versioning the agent.

use url::Url;

/// Upload chunk size, bytes
pub const UPLOAD_CHUNK_SIZE: usize = 1024;

/// Marker frame ending an upload stream
pub const UPLOAD_EOF_MARKER: &str = "EOF";

/// One remote operation against a helper agent
#[derive(Debug, Clone)]
pub enum Operation {
    /// Run a command and stream back its output
    Command { command: String, args: Vec<String> },

    /// Write `data` to `file_path`/`file_name` on the host
    Upload {
        file_name: String,
        file_path: String,
        data: Vec<u8>,
    },

    /// Check whether a TCP port is free on the host
    CheckPort { port: u16 },
}

impl Operation {
    pub fn command(program: impl Into<String>) -> Self {
        Operation::Command {
            command: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument; only meaningful for commands
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        if let Operation::Command { args, .. } = &mut self {
            args.push(value.into());
        } else {
            debug_assert!(false, "arg() on a non-command operation");
        }
        self
    }

    pub fn upload(
        file_name: impl Into<String>,
        file_path: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Operation::Upload {
            file_name: file_name.into(),
            file_path: file_path.into(),
            data,
        }
    }

    pub fn check_port(port: u16) -> Self {
        Operation::CheckPort { port }
    }

    /// Agent endpoint path for this operation
    pub fn path(&self) -> &'static str {
        match self {
            Operation::Command { .. } => "cmd/",
            Operation::Upload { .. } => "upload/",
            Operation::CheckPort { .. } => "check/",
        }
    }

    /// Full `wss://` URL against one host's agent
    pub fn url(&self, host: &str, port: u16) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("wss://{}:{}/{}", host, port, self.path()))?;
        {
            let mut query = url.query_pairs_mut();
            match self {
                Operation::Command { command, args } => {
                    query.append_pair("command", command);
                    for arg in args {
                        query.append_pair("args", arg);
                    }
                }
                Operation::Upload {
                    file_name,
                    file_path,
                    ..
                } => {
                    query.append_pair("file_name", file_name);
                    query.append_pair("file_path", file_path);
                }
                Operation::CheckPort { port } => {
                    query.append_pair("port", &port.to_string());
                }
            }
        }
        Ok(url)
    }

    /// Short description for log lines
    pub fn describe(&self) -> String {
        match self {
            Operation::Command { command, args } => {
                if args.is_empty() {
                    format!("cmd {}", command)
                } else {
                    format!("cmd {} {}", command, args.join(" "))
                }
            }
            Operation::Upload {
                file_name,
                file_path,
                data,
            } => format!("upload {}/{} ({} bytes)", file_path, file_name, data.len()),
            Operation::CheckPort { port } => format!("check port {}", port),
        }
    }

    /// Payload split into wire-sized chunks; empty for non-uploads
    pub fn upload_chunks(&self) -> Vec<&[u8]> {
        match self {
            Operation::Upload { data, .. } => data.chunks(UPLOAD_CHUNK_SIZE).collect(),
            _ => Vec::new(),
        }
    }
}
