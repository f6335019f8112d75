//! Runtime orchestration for game servers: one façade over a container engine or local
//! processes, with port allocation, durable per-instance metadata, stats, player lookup and
//! console command delivery.

pub mod backend;
pub mod config;
pub mod console_log;
pub mod dispatch;
pub mod error;
pub mod launch;
pub mod layout;
pub mod lifecycle;
pub mod manager;
pub mod metadata;
pub mod monitor;
pub mod player_info;
pub mod port_alloc;
pub mod rcon;
pub mod stats;
pub mod status_query;
pub mod workload;

pub use manager::{RuntimeManager, StopOptions};
