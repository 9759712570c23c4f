// Progressive-download range cache for streaming media.

pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod logging;
pub mod server;
pub mod source;

pub use engine::loader::CacheEngine;
pub use engine::session::{LoadHandle, ReadRequest};
pub use error::{CacheError, CacheResult};
