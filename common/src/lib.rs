//! Shared infrastructure for the SigmaPilot services.
//!
//! Everything the four services agree on lives here: the bus contract
//! (subjects + payload shapes), database access and migrations, the HTTP
//! scaffolding every service exposes, and the thin Hyperliquid info client.
//! Service-specific logic stays in the service crates.

pub mod assets;
pub mod bus;
pub mod db;
pub mod env;
pub mod http;
pub mod hyperliquid;
pub mod ratelimit;
