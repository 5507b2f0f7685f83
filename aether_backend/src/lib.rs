pub mod bootstrap;
pub mod committer;
pub mod config;
pub mod database;
pub mod error;
pub mod fingerprint;
pub mod forum;
pub mod identity;
pub mod network;
pub mod node;
pub mod protocol;
pub mod signals;
pub mod telemetry;
pub mod update;
pub mod utils;
