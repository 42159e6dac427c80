//! SQLite-backed store via `tokio-rusqlite`.
//!
//! All statements run on the connection's dedicated thread. A commit is one
//! SQLite transaction executed inside a single `call`, so dropping the caller's
//! future cannot split the idempotency record from its attendance writes.

use crate::{AttendanceStore, CommitOutcome, IdempotencyRecord, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{
    ActivityScheduleId, AttendanceLog, AttendanceMutation, AttendanceState, CampId, CamperId,
    FaceEmbedding, GroupId, RequestId,
};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS camper_embeddings (
    camper_id   INTEGER PRIMARY KEY,
    camp_id     INTEGER NOT NULL,
    group_id    INTEGER NOT NULL,
    embedding   BLOB NOT NULL,
    enrolled_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_camper_embeddings_group ON camper_embeddings(group_id);

CREATE TABLE IF NOT EXISTS activity_schedules (
    activity_schedule_id INTEGER PRIMARY KEY,
    camp_id              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance_status (
    camper_id            INTEGER NOT NULL,
    activity_schedule_id INTEGER NOT NULL,
    state                TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    PRIMARY KEY (camper_id, activity_schedule_id)
);

CREATE TABLE IF NOT EXISTS attendance_logs (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    camper_id            INTEGER NOT NULL,
    activity_schedule_id INTEGER NOT NULL,
    timestamp            TEXT NOT NULL,
    event_type           TEXT NOT NULL,
    check_in_method      TEXT NOT NULL,
    staff_id             INTEGER NOT NULL,
    participation_status TEXT NOT NULL,
    note                 TEXT,
    request_id           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_logs_pair
    ON attendance_logs(camper_id, activity_schedule_id);

CREATE TABLE IF NOT EXISTS idempotency_records (
    request_id  TEXT PRIMARY KEY,
    camp_id     INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    result      TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotency_recorded_at ON idempotency_records(recorded_at);
";

/// Raw idempotency row; the result JSON is decoded off the database thread.
struct RecordRow {
    request_id: String,
    camp_id: i64,
    fingerprint: String,
    result: String,
    recorded_at: DateTime<Utc>,
}

impl RecordRow {
    fn into_record(self) -> Result<IdempotencyRecord, StoreError> {
        Ok(IdempotencyRecord {
            request_id: RequestId(self.request_id),
            camp_id: CampId(self.camp_id),
            fingerprint: self.fingerprint,
            result: serde_json::from_str(&self.result)?,
            recorded_at: self.recorded_at,
        })
    }
}

enum TxOutcome {
    Committed,
    Duplicate(RecordRow),
    Stale(CamperId, ActivityScheduleId),
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        tracing::debug!("attendance schema ready");
        Ok(Self { conn })
    }

    /// Store (or replace) a camper's enrolled embedding.
    pub async fn enroll(&self, embedding: FaceEmbedding) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO camper_embeddings (camper_id, camp_id, group_id, embedding, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(camper_id) DO UPDATE SET
                        camp_id = excluded.camp_id,
                        group_id = excluded.group_id,
                        embedding = excluded.embedding,
                        enrolled_at = excluded.enrolled_at",
                    params![
                        embedding.camper_id.0,
                        embedding.camp_id.0,
                        embedding.group_id.0,
                        encode_embedding(&embedding.values),
                        Utc::now(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn add_activity_schedule(
        &self,
        id: ActivityScheduleId,
        camp_id: CampId,
    ) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO activity_schedules (activity_schedule_id, camp_id)
                     VALUES (?1, ?2)",
                    params![id.0, camp_id.0],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Number of attendance log rows for one camper on one schedule.
    pub async fn history_len(
        &self,
        camper_id: CamperId,
        activity_schedule_id: ActivityScheduleId,
    ) -> Result<usize, StoreError> {
        let count = self
            .conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance_logs
                     WHERE camper_id = ?1 AND activity_schedule_id = ?2",
                    params![camper_id.0, activity_schedule_id.0],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(count as usize)
    }
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Little-endian f32 blob. A truncated blob decodes to an empty vector, which
/// the matcher treats as incomparable.
fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    if blob.len() % 4 != 0 {
        return Vec::new();
    }
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn load_record(
    conn: &rusqlite::Connection,
    request_id: &str,
) -> rusqlite::Result<Option<RecordRow>> {
    conn.query_row(
        "SELECT request_id, camp_id, fingerprint, result, recorded_at
         FROM idempotency_records WHERE request_id = ?1",
        params![request_id],
        |row| {
            Ok(RecordRow {
                request_id: row.get(0)?,
                camp_id: row.get(1)?,
                fingerprint: row.get(2)?,
                result: row.get(3)?,
                recorded_at: row.get(4)?,
            })
        },
    )
    .optional()
}

/// Apply one guarded attendance write. Returns `false` if the guard failed.
fn upsert_attendance(
    tx: &rusqlite::Transaction<'_>,
    m: &AttendanceMutation,
    request_id: &str,
) -> rusqlite::Result<bool> {
    let log: &AttendanceLog = &m.log;
    let changed = match m.expected {
        None => tx.execute(
            "INSERT INTO attendance_status (camper_id, activity_schedule_id, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(camper_id, activity_schedule_id) DO NOTHING",
            params![
                log.camper_id.0,
                log.activity_schedule_id.0,
                m.next.as_str(),
                log.timestamp
            ],
        )?,
        Some(expected) => tx.execute(
            "UPDATE attendance_status SET state = ?1, updated_at = ?2
             WHERE camper_id = ?3 AND activity_schedule_id = ?4 AND state = ?5",
            params![
                m.next.as_str(),
                log.timestamp,
                log.camper_id.0,
                log.activity_schedule_id.0,
                expected.as_str()
            ],
        )?,
    };
    if changed == 0 {
        return Ok(false);
    }

    tx.execute(
        "INSERT INTO attendance_logs (
            camper_id, activity_schedule_id, timestamp, event_type, check_in_method,
            staff_id, participation_status, note, request_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            log.camper_id.0,
            log.activity_schedule_id.0,
            log.timestamp,
            log.event_type.as_str(),
            log.check_in_method,
            log.staff_id.0,
            log.participation_status.as_str(),
            log.note,
            request_id,
        ],
    )?;
    Ok(true)
}

#[async_trait]
impl AttendanceStore for SqliteStore {
    async fn camper_embeddings(
        &self,
        group_id: GroupId,
    ) -> Result<BTreeMap<CamperId, FaceEmbedding>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT camper_id, camp_id, embedding FROM camper_embeddings
                     WHERE group_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![group_id.0], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(camper_id, camp_id, blob)| {
                let values = decode_embedding(&blob);
                if values.is_empty() {
                    tracing::warn!(camper_id, bytes = blob.len(), "undecodable embedding blob");
                }
                (
                    CamperId(camper_id),
                    FaceEmbedding {
                        camper_id: CamperId(camper_id),
                        camp_id: CampId(camp_id),
                        group_id,
                        values,
                    },
                )
            })
            .collect())
    }

    async fn attendance_state(
        &self,
        camper_id: CamperId,
        activity_schedule_id: ActivityScheduleId,
    ) -> Result<Option<AttendanceState>, StoreError> {
        let raw = self
            .conn
            .call(move |conn| {
                let state = conn
                    .query_row(
                        "SELECT state FROM attendance_status
                         WHERE camper_id = ?1 AND activity_schedule_id = ?2",
                        params![camper_id.0, activity_schedule_id.0],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(state)
            })
            .await?;

        raw.map(|s| {
            AttendanceState::parse(&s)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown attendance state {s:?}")))
        })
        .transpose()
    }

    async fn activity_schedule_camp(
        &self,
        activity_schedule_id: ActivityScheduleId,
    ) -> Result<Option<CampId>, StoreError> {
        let camp = self
            .conn
            .call(move |conn| {
                let camp = conn
                    .query_row(
                        "SELECT camp_id FROM activity_schedules WHERE activity_schedule_id = ?1",
                        params![activity_schedule_id.0],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()?;
                Ok(camp)
            })
            .await?;
        Ok(camp.map(CampId))
    }

    async fn find_outcome(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let key = request_id.0.clone();
        let row = self
            .conn
            .call(move |conn| Ok(load_record(conn, &key)?))
            .await?;
        row.map(RecordRow::into_record).transpose()
    }

    async fn commit(
        &self,
        record: IdempotencyRecord,
        mutations: Vec<AttendanceMutation>,
    ) -> Result<CommitOutcome, StoreError> {
        let result_json = serde_json::to_string(&record.result)?;
        let request_id = record.request_id.0.clone();
        let camp_id = record.camp_id.0;
        let fingerprint = record.fingerprint.clone();
        let recorded_at = record.recorded_at;

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(existing) = load_record(&tx, &request_id)? {
                    return Ok(TxOutcome::Duplicate(existing));
                }
                for m in &mutations {
                    if !upsert_attendance(&tx, m, &request_id)? {
                        // Dropping `tx` rolls back every write made so far.
                        return Ok(TxOutcome::Stale(
                            m.log.camper_id,
                            m.log.activity_schedule_id,
                        ));
                    }
                }
                tx.execute(
                    "INSERT INTO idempotency_records (request_id, camp_id, fingerprint, result, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![request_id, camp_id, fingerprint, result_json, recorded_at],
                )?;
                tx.commit()?;
                Ok(TxOutcome::Committed)
            })
            .await?;

        match outcome {
            TxOutcome::Committed => Ok(CommitOutcome::Committed),
            TxOutcome::Duplicate(row) => Ok(CommitOutcome::Duplicate(row.into_record()?)),
            TxOutcome::Stale(camper_id, activity_schedule_id) => Err(StoreError::StaleWrite {
                camper_id,
                activity_schedule_id,
            }),
        }
    }

    async fn prune_idempotency(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM idempotency_records WHERE recorded_at < ?1",
                    params![before],
                )?)
            })
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{AttendanceUpdateResult, StaffId, Transition};

    fn record(request_id: &str) -> IdempotencyRecord {
        let rid = RequestId::from(request_id);
        IdempotencyRecord {
            request_id: rid.clone(),
            camp_id: CampId(7),
            fingerprint: "00ff".into(),
            result: AttendanceUpdateResult::rejected(rid, ActivityScheduleId(11)),
            recorded_at: Utc::now(),
        }
    }

    fn mutation(camper: i64, current: Option<AttendanceState>) -> AttendanceMutation {
        AttendanceMutation::for_transition(
            Transition::plan(current),
            CamperId(camper),
            ActivityScheduleId(11),
            StaffId(1),
            None,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_embedding_blob_roundtrip() {
        let values = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&values)), values);
        assert!(decode_embedding(&[1, 2, 3]).is_empty());
    }

    #[tokio::test]
    async fn test_embeddings_filtered_by_group() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for (camper, group) in [(1, 3), (2, 3), (3, 4)] {
            store
                .enroll(FaceEmbedding {
                    camper_id: CamperId(camper),
                    camp_id: CampId(7),
                    group_id: GroupId(group),
                    values: vec![camper as f32, 0.0],
                })
                .await
                .unwrap();
        }
        let group = store.camper_embeddings(GroupId(3)).await.unwrap();
        assert_eq!(group.keys().copied().collect::<Vec<_>>(), vec![CamperId(1), CamperId(2)]);
        assert_eq!(group[&CamperId(2)].values, vec![2.0, 0.0]);
    }

    #[tokio::test]
    async fn test_commit_and_replay() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let outcome = store
            .commit(record("r1"), vec![mutation(42, None)])
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(
            store
                .attendance_state(CamperId(42), ActivityScheduleId(11))
                .await
                .unwrap(),
            Some(AttendanceState::CheckedIn)
        );

        let again = store
            .commit(record("r1"), vec![mutation(42, Some(AttendanceState::CheckedIn))])
            .await
            .unwrap();
        assert!(matches!(again, CommitOutcome::Duplicate(r) if r.camp_id == CampId(7)));
        assert_eq!(
            store
                .history_len(CamperId(42), ActivityScheduleId(11))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_stale_write_rolls_back_everything() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .commit(record("r1"), vec![mutation(1, None)])
            .await
            .unwrap();

        let err = store
            .commit(record("r2"), vec![mutation(2, None), mutation(1, None)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleWrite { camper_id: CamperId(1), .. }));
        assert_eq!(
            store
                .attendance_state(CamperId(2), ActivityScheduleId(11))
                .await
                .unwrap(),
            None
        );
        assert!(store.find_outcome(&RequestId::from("r2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schedule_lookup_and_prune() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .add_activity_schedule(ActivityScheduleId(11), CampId(7))
            .await
            .unwrap();
        assert_eq!(
            store
                .activity_schedule_camp(ActivityScheduleId(11))
                .await
                .unwrap(),
            Some(CampId(7))
        );
        assert_eq!(
            store
                .activity_schedule_camp(ActivityScheduleId(12))
                .await
                .unwrap(),
            None
        );

        store.commit(record("r1"), vec![]).await.unwrap();
        let pruned = store
            .prune_idempotency(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }
}
