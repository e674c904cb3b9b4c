pub mod clock;
pub mod config;
pub mod core;
pub mod dependency;
pub mod error;
pub mod log;
pub mod metrics;
pub mod orchestration;
pub mod state;
pub mod util;

pub use error::{Error, Result};
