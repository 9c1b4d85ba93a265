//! Shepherd
//!
//! A single-host lifecycle manager for long-running external services
//! (interpreters, native daemons, system services).
//!
//! # Overview
//!
//! The manager:
//! - starts services in base-before-optional order and verifies each
//!   one healthy before moving on
//! - retries failed starts with exponential backoff, treating a start
//!   that never becomes healthy exactly like a failed spawn
//! - persists runtime facts so a later invocation can still find and
//!   terminate processes spawned by an earlier one
//! - terminates whole process trees, escalating from SIGTERM to SIGKILL
//! - mirrors service presence into a Consul-compatible registry, and
//!   keeps working when the registry is down
//!
//! # Example Configuration
//!
//! ```yaml
//! external_services:
//!   base_services:
//!     - service_name: ollama_server
//!       script: ollama
//!       command: ollama
//!       args: ["serve"]
//!       health_check_url: "http://127.0.0.1:11434/api/tags"
//!
//!   optional_services:
//!     - service_name: asr_server
//!       script: servers/asr/server.py
//!       conda_env: /opt/conda/envs/asr
//!       use_python: true
//!       args: ["--port", "8001"]
//!       startup_timeout: 120
//!
//! consul:
//!   enabled: true
//!   url: "http://127.0.0.1:8500"
//!   service_prefix: shepherd
//! ```

pub mod cli;
pub mod config;
pub mod consul;
pub mod error;
pub mod runtime;
pub mod state;

pub use cli::ManagerArgs;
pub use config::{CommandSpec, RawService, ServiceFile, ServiceSpec};
pub use consul::{ConsulConfig, ConsulProcess, ConsulRegistry, RegistryEntry};
pub use error::{Result, ServiceError};
pub use runtime::{
    HealthVerifier, Liveness, Orchestrator, Probe, ProcessSupervisor, RetryPolicy, StartReport,
    StatusReport, StopReport,
};
pub use state::{RuntimeRecord, ServiceClass, ServiceStatus, StateStore};
