//! 执行支撑：资源准入、步骤处理器、产物存储

mod artifacts;
mod handlers;
mod resources;

pub use artifacts::{
    AnimationData, ArtifactError, ArtifactMetadata, ArtifactStore, ANIMATION_FILE, METADATA_FILE,
};
pub use handlers::{
    HandlerRegistry, PlaceholderSynthesizer, PostProcessor, PrepareMotionData, StepData,
    StepHandler, StepRunner, POSE_WIDTH,
};
pub use resources::{InsufficientResources, Reservation, ResourcePool, Utilization};
