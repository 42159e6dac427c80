//! Attendance transitions and per-event identity resolution.

use crate::types::{ActivityScheduleId, CamperId, RequestId, StaffId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Check-in method stamped on logs written by this pipeline.
pub const FACE_RECOGNITION_METHOD: &str = "face-recognition";

/// Current attendance status of one camper for one activity schedule.
///
/// Only moves forward: `NotCheckedIn -> CheckedIn -> CheckedOut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceState {
    NotCheckedIn,
    CheckedIn,
    CheckedOut,
}

impl AttendanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotCheckedIn => "not_checked_in",
            Self::CheckedIn => "checked_in",
            Self::CheckedOut => "checked_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_checked_in" => Some(Self::NotCheckedIn),
            "checked_in" => Some(Self::CheckedIn),
            "checked_out" => Some(Self::CheckedOut),
            _ => None,
        }
    }

    /// The single forward step from this state, if any.
    pub fn advance(self) -> Option<Self> {
        match self {
            Self::NotCheckedIn => Some(Self::CheckedIn),
            Self::CheckedIn => Some(Self::CheckedOut),
            Self::CheckedOut => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    CheckIn,
    CheckOut,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::CheckOut => "check_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParticipationStatus {
    Present,
    Completed,
}

impl ParticipationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Completed => "completed",
        }
    }
}

/// One entry in a camper's attendance history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceLog {
    pub camper_id: CamperId,
    pub activity_schedule_id: ActivityScheduleId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub check_in_method: String,
    pub staff_id: StaffId,
    pub participation_status: ParticipationStatus,
    pub note: Option<String>,
}

/// What to do with a resolved camper given their current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No record yet: create one, checked in.
    Create,
    /// Existing record moves one step forward.
    Advance {
        from: AttendanceState,
        to: AttendanceState,
    },
    /// Backward or no-op; leave the record untouched.
    Skip,
}

impl Transition {
    pub fn plan(current: Option<AttendanceState>) -> Self {
        match current {
            None => Self::Create,
            Some(from) => match from.advance() {
                Some(to) => Self::Advance { from, to },
                None => Self::Skip,
            },
        }
    }
}

/// A single attendance write, guarded by the state it was planned against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceMutation {
    /// `None` means the record must not exist yet.
    pub expected: Option<AttendanceState>,
    pub next: AttendanceState,
    pub log: AttendanceLog,
}

impl AttendanceMutation {
    /// Build the write for `transition`, or `None` when it is a skip.
    pub fn for_transition(
        transition: Transition,
        camper_id: CamperId,
        activity_schedule_id: ActivityScheduleId,
        staff_id: StaffId,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        let (expected, next) = match transition {
            Transition::Create => (None, AttendanceState::CheckedIn),
            Transition::Advance { from, to } => (Some(from), to),
            Transition::Skip => return None,
        };
        let (event_type, participation_status) = match next {
            AttendanceState::CheckedOut => (EventType::CheckOut, ParticipationStatus::Completed),
            _ => (EventType::CheckIn, ParticipationStatus::Present),
        };
        Some(Self {
            expected,
            next,
            log: AttendanceLog {
                camper_id,
                activity_schedule_id,
                timestamp: at,
                event_type,
                check_in_method: FACE_RECOGNITION_METHOD.to_string(),
                staff_id,
                participation_status,
                note,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchSource {
    PreMatched,
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnmatchedReason {
    NoCandidate,
    BelowThreshold,
    /// Another face in the same event claimed this camper with higher confidence.
    Conflict,
    InvalidEmbedding,
}

/// Identity resolved for one face of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceResolution {
    Matched {
        face_index: usize,
        camper_id: CamperId,
        confidence: f32,
        distance: Option<f32>,
        source: MatchSource,
    },
    Unmatched {
        face_index: usize,
        reason: UnmatchedReason,
    },
}

impl FaceResolution {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }
}

/// Ensure each camper is claimed by at most one face.
///
/// The highest-confidence face keeps the camper; on equal confidence the
/// earlier face wins. Losers become `Unmatched { reason: Conflict }`.
/// Returns the number of faces demoted.
pub fn resolve_conflicts(resolutions: &mut [FaceResolution]) -> usize {
    let mut winner: HashMap<CamperId, (usize, f32)> = HashMap::new();
    for (pos, res) in resolutions.iter().enumerate() {
        if let FaceResolution::Matched {
            camper_id,
            confidence,
            ..
        } = res
        {
            let entry = winner.entry(*camper_id).or_insert((pos, *confidence));
            if *confidence > entry.1 {
                *entry = (pos, *confidence);
            }
        }
    }

    let mut demoted = 0;
    for (pos, res) in resolutions.iter_mut().enumerate() {
        if let FaceResolution::Matched {
            face_index,
            camper_id,
            ..
        } = res
        {
            if winner.get(camper_id).map(|(w, _)| *w) != Some(pos) {
                *res = FaceResolution::Unmatched {
                    face_index: *face_index,
                    reason: UnmatchedReason::Conflict,
                };
                demoted += 1;
            }
        }
    }
    demoted
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceAction {
    Created,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizedCamper {
    pub camper_id: CamperId,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    pub match_source: MatchSource,
    pub action: AttendanceAction,
    /// State after this event was applied.
    pub state: AttendanceState,
}

/// Outcome of reconciling one recognition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceUpdateResult {
    pub success: bool,
    pub request_id: RequestId,
    pub activity_schedule_id: ActivityScheduleId,
    pub created_count: u32,
    pub updated_count: u32,
    pub unmatched_faces: u32,
    pub conflicts_resolved: u32,
    pub recognized_campers: Vec<RecognizedCamper>,
    pub timestamp: DateTime<Utc>,
}

impl AttendanceUpdateResult {
    /// Empty, unsuccessful result for an event that was rejected.
    pub fn rejected(request_id: RequestId, activity_schedule_id: ActivityScheduleId) -> Self {
        Self {
            success: false,
            request_id,
            activity_schedule_id,
            created_count: 0,
            updated_count: 0,
            unmatched_faces: 0,
            conflicts_resolved: 0,
            recognized_campers: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}
