//! Service configuration parsing and validation

mod ports;
mod service_file;

pub use ports::*;
pub use service_file::*;
