//! vcnest: bind worker hosts into and out of nested per-tenant control planes
//!
//! The engine reconciles each VirtualCluster's declared membership against
//! what its own API reports, drives join/unjoin pipelines over a per-host
//! helper agent, and tracks host health with flap-resistant hysteresis.

pub mod agent;
pub mod api;
pub mod cli;
pub mod config;
pub mod controller;
pub mod flows;
pub mod workflow;
