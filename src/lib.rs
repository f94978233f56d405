pub mod cmd;
pub mod config;
mod error;
pub mod eventlog;
pub mod fetch;
pub mod history;
pub mod manager;
pub mod media_files;
pub mod paths;
pub mod quality;
pub mod ytdlp;

pub use error::{EngineError, Result};
