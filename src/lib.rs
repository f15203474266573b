pub mod commands;
pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod hub;
pub mod job;
pub mod queue;
pub mod store;

pub use error::{Error, Result};
