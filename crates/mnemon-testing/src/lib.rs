//! Fixtures for integration tests: session-file builders and scripted fake
//! analyzer agents.

mod agents;
mod sessions;

pub use agents::*;
pub use sessions::*;
