//! IP Manager - service registry and endpoint allocator
//!
//! Lets independently started microservices claim a unique `(ip, port)`
//! endpoint, report liveness, and have endpoint collisions detected and
//! resolved.
//!
//! ## Components
//!
//! - **Allocation**: validated, hot-swappable allocation config and the port allocator
//! - **Registry**: the authoritative registration table
//! - **Heartbeat**: liveness tracking and the periodic status sweep
//! - **Conflicts**: duplicate endpoint, reachability and preference scans
//! - **Server**: JSON-over-HTTP API

pub mod allocation;
pub mod config;
pub mod conflicts;
pub mod error;
pub mod heartbeat;
pub mod registry;
pub mod server;
pub mod types;

pub use config::{Args, Config};
pub use error::{RegistryError, Result};
pub use registry::Registry;
pub use server::create_router;
