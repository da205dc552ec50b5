//! Wakegate - a reverse proxy that wakes its gateway on demand
//!
//! This library provides a single-gateway proxy that:
//! - Redirects to a local `/setup` namespace until the gateway is configured
//! - Spawns the gateway process on the first request that needs it
//! - Coalesces concurrent start attempts into one spawn and one readiness probe
//! - Forwards HTTP and upgraded (WebSocket) traffic to the gateway
//! - Keeps a stable gateway token across restarts of the host process

pub mod config;
pub mod error;
pub mod pool;
pub mod probe;
pub mod process;
pub mod proxy;
pub mod setup;
pub mod supervisor;
pub mod token;
