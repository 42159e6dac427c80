//! rollcall-store: Persistence seam for the attendance pipeline.
//!
//! The relational store is owned by the wider backend; this crate models the
//! narrow slice the reconciler needs as the [`AttendanceStore`] trait, with a
//! SQLite implementation for the daemon and an in-memory one for tests.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{
    ActivityScheduleId, AttendanceMutation, AttendanceState, AttendanceUpdateResult, CampId,
    CamperId, FaceEmbedding, GroupId, RequestId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("attendance for camper {camper_id} on schedule {activity_schedule_id} changed concurrently")]
    StaleWrite {
        camper_id: CamperId,
        activity_schedule_id: ActivityScheduleId,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Cached outcome of a processed webhook, keyed by its request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub request_id: RequestId,
    pub camp_id: CampId,
    /// SHA-256 of the raw webhook body, hex encoded.
    pub fingerprint: String,
    pub result: AttendanceUpdateResult,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed,
    /// The request id was already committed; nothing was written.
    Duplicate(IdempotencyRecord),
}

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Enrolled embeddings for every camper in `group_id`.
    async fn camper_embeddings(
        &self,
        group_id: GroupId,
    ) -> Result<BTreeMap<CamperId, FaceEmbedding>, StoreError>;

    async fn attendance_state(
        &self,
        camper_id: CamperId,
        activity_schedule_id: ActivityScheduleId,
    ) -> Result<Option<AttendanceState>, StoreError>;

    /// Camp owning the schedule, or `None` for an unknown schedule.
    async fn activity_schedule_camp(
        &self,
        activity_schedule_id: ActivityScheduleId,
    ) -> Result<Option<CampId>, StoreError>;

    async fn find_outcome(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Apply every mutation and persist `record` as one atomic unit.
    ///
    /// Either all of it lands or none of it does. Fails with
    /// [`StoreError::StaleWrite`] when a record no longer holds the state a
    /// mutation was planned against.
    async fn commit(
        &self,
        record: IdempotencyRecord,
        mutations: Vec<AttendanceMutation>,
    ) -> Result<CommitOutcome, StoreError>;

    /// Delete idempotency records older than `before`. Returns how many went.
    async fn prune_idempotency(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
}
