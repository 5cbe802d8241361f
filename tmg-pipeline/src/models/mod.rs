//! Data models for the timing pipeline

pub mod observation;
pub mod pulsar;
pub mod snapshot;
pub mod toa;

pub use observation::{FileStatus, NewObservation, ObservationFile};
pub use pulsar::PulsarSource;
pub use snapshot::{FitMode, ParamValue, Residual, SnapshotDraft, TimingSolutionSnapshot};
pub use toa::{ExtractedToa, Toa};
