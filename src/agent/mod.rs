//! Remote execution against per-host helper agents
//!
//! Split in three layers: [`operation`] encodes what to run, [`transport`]
//! carries one operation over one WebSocket connection, and [`client`] adds
//! the missing-script self-heal on top.

pub mod client;
pub mod operation;
pub mod transport;

pub use client::{AgentClient, AgentError};
pub use operation::Operation;
pub use transport::{AgentCall, AgentTarget, ExecOutcome, ExecStatus, WsAgentCall};
