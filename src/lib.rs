pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod health;
pub mod intake;
pub mod log;
pub mod processor;
pub mod supervisor;
pub mod task;
pub mod workspace;

pub use error::{Error, Result};
pub use supervisor::{Mode, Phase};
