pub mod config;
pub mod error;
pub mod logging;
pub mod simulation;

pub use config::Config;
pub use error::{Error, Result};
