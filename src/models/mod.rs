pub mod capture;
pub mod context;
pub mod job;
pub mod pose;

pub use capture::{CaptureEvent, DetectedAt};
pub use context::{InstanceType, LogContext, LogUser, Presence};
pub use job::{JobState, TransitionError, UploadJob, Visibility};
pub use pose::{PoseMetadata, Position, Rotation};
