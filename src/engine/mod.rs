// Engine: fragment bookkeeping, on-disk store, planning, pipelines and sessions.

pub mod buffer;
pub mod cache;
pub mod directory;
pub mod fragment;
pub mod loader;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod record;
pub mod registry;
pub mod session;
