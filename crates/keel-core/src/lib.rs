pub mod adapters;
pub mod config;
pub mod engine;
pub mod execution;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod registry;
pub mod service;
pub mod sqlite;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineParts};
