//! Runtime components for service lifecycle management

pub mod health;
pub mod orchestrator;
pub mod retry;
pub mod supervisor;

pub use health::*;
pub use orchestrator::*;
pub use retry::*;
pub use supervisor::*;
