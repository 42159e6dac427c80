//! rollcall-core: Face matching and attendance reconciliation primitives.
//!
//! Everything here is pure: identity resolution against enrolled embeddings,
//! the per-camp index state machine, webhook payload decoding, and the
//! forward-only attendance transition table.

pub mod attendance;
pub mod event;
pub mod index;
pub mod matcher;
pub mod types;

pub use attendance::{
    AttendanceAction, AttendanceLog, AttendanceMutation, AttendanceState, AttendanceUpdateResult,
    FaceResolution, MatchSource, RecognizedCamper, Transition, UnmatchedReason,
};
pub use event::{EventError, FaceQuery, RecognitionEvent, RecognizedFace};
pub use index::{IndexStatus, LoadedIndexState};
pub use matcher::{DistanceMetric, FaceMatcher, MatchError, MatchResult, Matcher};
pub use types::{
    ActivityScheduleId, BoundingBox, CampId, CamperId, FaceEmbedding, GroupId, RequestId, StaffId,
};
