//! Per-camp state of the recognition engine's embedding index.

use crate::types::{CampId, GroupId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexStatus {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Failed,
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one camp's index as last observed by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedIndexState {
    pub camp_id: CampId,
    pub status: IndexStatus,
    /// Groups the engine reported as included in the loaded index.
    pub group_ids: BTreeSet<GroupId>,
    pub face_count: u32,
    pub last_transition: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl LoadedIndexState {
    pub fn unloaded(camp_id: CampId) -> Self {
        Self {
            camp_id,
            status: IndexStatus::Unloaded,
            group_ids: BTreeSet::new(),
            face_count: 0,
            last_transition: Utc::now(),
            failure_reason: None,
        }
    }

    /// Recognition events for this camp may only be applied in this state.
    pub fn accepts_events(&self) -> bool {
        self.status == IndexStatus::Loaded
    }

    /// Move to `status`, stamping the transition time. Leaving `Failed`
    /// clears the recorded failure reason.
    pub fn transition(&mut self, status: IndexStatus) {
        self.status = status;
        self.last_transition = Utc::now();
        if status != IndexStatus::Failed {
            self.failure_reason = None;
        }
    }

    pub fn mark_loaded(&mut self, group_ids: BTreeSet<GroupId>, face_count: u32) {
        self.group_ids = group_ids;
        self.face_count = face_count;
        self.transition(IndexStatus::Loaded);
    }

    pub fn mark_unloaded(&mut self) {
        self.group_ids.clear();
        self.face_count = 0;
        self.transition(IndexStatus::Unloaded);
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.transition(IndexStatus::Failed);
        self.failure_reason = Some(reason.into());
    }
}
