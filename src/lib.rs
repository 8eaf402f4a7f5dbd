pub mod claimcheck;
pub mod config;
pub mod connection;
pub mod logging;
pub mod message;
pub mod node;
pub mod pool;
pub mod publish;
pub mod schedule;
pub mod server;
pub mod shutdown;
pub mod stats;
pub mod wire;
