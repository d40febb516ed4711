pub mod bootstrap;
pub mod cloud_image;
pub mod cloud_init;
pub mod error;
pub mod launcher;
pub mod logger;
pub mod orchestrator;
pub mod provider_manager;
pub mod settings;
pub mod snapshot;
pub mod state_machine;
pub mod wait;

pub use error::{BuildError, BuildResult, RotationWarning};
pub use orchestrator::{BuildOutcome, ImageBuilder, RunOptions};
pub use settings::BuilderSettings;
pub use state_machine::BuildState;
