//! In-process store. Used by tests and `ROLLCALL_MEMORY_STORE=1` dev runs.

use crate::{AttendanceStore, CommitOutcome, IdempotencyRecord, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{
    ActivityScheduleId, AttendanceLog, AttendanceMutation, AttendanceState, CampId, CamperId,
    FaceEmbedding, GroupId, RequestId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Inner {
    embeddings: HashMap<CamperId, FaceEmbedding>,
    schedules: HashMap<ActivityScheduleId, CampId>,
    status: HashMap<(CamperId, ActivityScheduleId), AttendanceState>,
    logs: Vec<AttendanceLog>,
    idempotency: HashMap<RequestId, IdempotencyRecord>,
    unavailable: Option<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store (or replace) a camper's enrolled embedding.
    pub fn enroll(&self, embedding: FaceEmbedding) {
        self.lock().embeddings.insert(embedding.camper_id, embedding);
    }

    pub fn add_activity_schedule(&self, id: ActivityScheduleId, camp_id: CampId) {
        self.lock().schedules.insert(id, camp_id);
    }

    /// Full transition history for one camper on one schedule, oldest first.
    pub fn history(
        &self,
        camper_id: CamperId,
        activity_schedule_id: ActivityScheduleId,
    ) -> Vec<AttendanceLog> {
        self.lock()
            .logs
            .iter()
            .filter(|l| l.camper_id == camper_id && l.activity_schedule_id == activity_schedule_id)
            .cloned()
            .collect()
    }

    /// Total attendance writes ever applied.
    pub fn mutation_count(&self) -> usize {
        self.lock().logs.len()
    }

    /// Make every subsequent commit fail until cleared with `None`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.lock().unavailable = reason.map(str::to_string);
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn camper_embeddings(
        &self,
        group_id: GroupId,
    ) -> Result<BTreeMap<CamperId, FaceEmbedding>, StoreError> {
        Ok(self
            .lock()
            .embeddings
            .values()
            .filter(|e| e.group_id == group_id)
            .map(|e| (e.camper_id, e.clone()))
            .collect())
    }

    async fn attendance_state(
        &self,
        camper_id: CamperId,
        activity_schedule_id: ActivityScheduleId,
    ) -> Result<Option<AttendanceState>, StoreError> {
        Ok(self
            .lock()
            .status
            .get(&(camper_id, activity_schedule_id))
            .copied())
    }

    async fn activity_schedule_camp(
        &self,
        activity_schedule_id: ActivityScheduleId,
    ) -> Result<Option<CampId>, StoreError> {
        Ok(self.lock().schedules.get(&activity_schedule_id).copied())
    }

    async fn find_outcome(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.lock().idempotency.get(request_id).cloned())
    }

    async fn commit(
        &self,
        record: IdempotencyRecord,
        mutations: Vec<AttendanceMutation>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.unavailable {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        if let Some(existing) = inner.idempotency.get(&record.request_id) {
            return Ok(CommitOutcome::Duplicate(existing.clone()));
        }

        // Check every guard before touching anything so a stale write leaves no trace.
        for m in &mutations {
            let key = (m.log.camper_id, m.log.activity_schedule_id);
            if inner.status.get(&key).copied() != m.expected {
                return Err(StoreError::StaleWrite {
                    camper_id: m.log.camper_id,
                    activity_schedule_id: m.log.activity_schedule_id,
                });
            }
        }

        for m in mutations {
            inner
                .status
                .insert((m.log.camper_id, m.log.activity_schedule_id), m.next);
            inner.logs.push(m.log);
        }
        inner.idempotency.insert(record.request_id.clone(), record);
        Ok(CommitOutcome::Committed)
    }

    async fn prune_idempotency(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let len = inner.idempotency.len();
        inner.idempotency.retain(|_, r| r.recorded_at >= before);
        Ok(len - inner.idempotency.len())
    }
}
