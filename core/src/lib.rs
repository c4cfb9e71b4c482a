pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod mux;
pub mod net;
pub mod playlist;
pub mod progress;
pub mod safety;
pub mod segment;
pub mod storage;
pub mod task;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::config::EngineConfig;
pub use crate::engine::{DownloadEngine, TaskSnapshot};
pub use crate::error::{CoreError, CoreResult, ErrorKind};
pub use crate::task::{OutputFormat, PostProcess, Task, TaskId, TaskOptions, TaskStatus};
