#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

pub mod bundler;
pub mod config;
pub mod engine;
pub mod error;
pub mod storage;
pub mod version;

pub use bundler::codes;
pub use config::{BuildConfig, CONFIG_FILE, Config};
pub use engine::{BuildResult, Engine, OutputAsset, OutputChunk, WriteStatus};
pub use error::Error;
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use version::VERSION;
