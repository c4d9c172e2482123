//! Stream relay lifecycle: process launch, job state, completion watching
//! and the job registry.

pub mod job;
pub mod launcher;
pub mod registry;
pub mod watcher;

pub use job::{StatusSnapshot, StreamJob, StreamStatus};
pub use launcher::{LaunchError, ProcessLauncher};
pub use registry::{RegistryError, StreamRegistry};
pub use watcher::CompletionWatcher;
