//! Attendance reconciliation: one recognition event in, attendance writes out,
//! with exactly-once effect per request id.

use crate::coordinator::Coordinator;
use crate::error::ErrorKind;
use crate::locks::KeyedLocks;
use chrono::Utc;
use rollcall_core::attendance::{resolve_conflicts, AttendanceAction};
use rollcall_core::{
    ActivityScheduleId, AttendanceMutation, AttendanceState, AttendanceUpdateResult, CampId, CamperId,
    FaceEmbedding, FaceQuery, FaceResolution, IndexStatus, MatchResult, MatchSource, Matcher,
    RecognitionEvent, RecognizedCamper, RequestId, StaffId, Transition, UnmatchedReason,
};
use rollcall_store::{AttendanceStore, CommitOutcome, IdempotencyRecord, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("invalid event: {0}")]
    BadRequest(String),
    #[error("index for camp {camp_id} is {status}, not loaded")]
    StaleIndex { camp_id: CampId, status: IndexStatus },
    #[error("activity schedule {0} not found")]
    NotFound(ActivityScheduleId),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::StaleIndex { .. } => ErrorKind::StaleIndex,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Result of [`Reconciler::reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub result: AttendanceUpdateResult,
    /// The request id had already been committed; `result` is the cached one.
    pub replayed: bool,
}

pub struct Reconciler {
    store: Arc<dyn AttendanceStore>,
    coordinator: Coordinator,
    matcher: Arc<dyn Matcher + Send + Sync>,
    threshold: f32,
    staff_id: StaffId,
    requests: KeyedLocks<RequestId>,
    records: KeyedLocks<(CamperId, ActivityScheduleId)>,
}

struct Matched {
    camper_id: CamperId,
    confidence: f32,
    distance: Option<f32>,
    source: MatchSource,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn AttendanceStore>,
        coordinator: Coordinator,
        matcher: Arc<dyn Matcher + Send + Sync>,
        threshold: f32,
        staff_id: StaffId,
    ) -> Self {
        Self {
            store,
            coordinator,
            matcher,
            threshold,
            staff_id,
            requests: KeyedLocks::new(),
            records: KeyedLocks::new(),
        }
    }

    /// Apply `event` to attendance.
    ///
    /// `fingerprint` identifies the raw payload and is kept with the
    /// idempotency record. Nothing is persisted unless the whole event
    /// succeeds; on error the sender may retry.
    pub async fn reconcile(
        &self,
        event: &RecognitionEvent,
        fingerprint: &str,
    ) -> Result<Reconciled, ReconcileError> {
        // Concurrent deliveries of the same request queue here, then replay.
        let _request = self.requests.lock(event.request_id.clone()).await;

        if let Some(record) = self.store.find_outcome(&event.request_id).await? {
            return Ok(self.replay(record, fingerprint));
        }

        let index = self.coordinator.state(event.camp_id);
        if !index.accepts_events() {
            tracing::warn!(
                request_id = %event.request_id,
                camp_id = %event.camp_id,
                status = %index.status,
                "rejecting event for camp without loaded index"
            );
            return Err(ReconcileError::StaleIndex {
                camp_id: event.camp_id,
                status: index.status,
            });
        }

        event.validate().map_err(|e| ReconcileError::BadRequest(e.to_string()))?;

        match self
            .store
            .activity_schedule_camp(event.activity_schedule_id)
            .await?
        {
            None => return Err(ReconcileError::NotFound(event.activity_schedule_id)),
            Some(camp_id) if camp_id != event.camp_id => {
                return Err(ReconcileError::BadRequest(format!(
                    "activity schedule {} belongs to camp {camp_id}, not {}",
                    event.activity_schedule_id, event.camp_id
                )))
            }
            Some(_) => {}
        }

        let mut resolutions = self.resolve_faces(event).await?;
        let conflicts = resolve_conflicts(&mut resolutions);
        if conflicts > 0 {
            tracing::info!(request_id = %event.request_id, conflicts, "duplicate campers in event resolved");
        }

        let matched: Vec<Matched> = resolutions
            .iter()
            .filter_map(|r| match r {
                FaceResolution::Matched {
                    camper_id,
                    confidence,
                    distance,
                    source,
                    ..
                } => Some(Matched {
                    camper_id: *camper_id,
                    confidence: *confidence,
                    distance: *distance,
                    source: *source,
                }),
                FaceResolution::Unmatched { .. } => None,
            })
            .collect();
        let unmatched = resolutions.len() - matched.len();

        // Hold every touched (camper, schedule) record until the commit lands.
        let _records = self
            .records
            .lock_all(
                matched
                    .iter()
                    .map(|m| (m.camper_id, event.activity_schedule_id)),
            )
            .await;

        let now = Utc::now();
        let mut mutations = Vec::new();
        let mut recognized = Vec::with_capacity(matched.len());
        let (mut created, mut updated) = (0u32, 0u32);

        for m in &matched {
            let current = self
                .store
                .attendance_state(m.camper_id, event.activity_schedule_id)
                .await?;
            let transition = Transition::plan(current);
            let action = match transition {
                Transition::Create => AttendanceAction::Created,
                Transition::Advance { .. } => AttendanceAction::Updated,
                Transition::Skip => AttendanceAction::Skipped,
            };
            let mutation = AttendanceMutation::for_transition(
                transition,
                m.camper_id,
                event.activity_schedule_id,
                self.staff_id,
                Some(format!(
                    "request {} ({:.3} confidence)",
                    event.request_id, m.confidence
                )),
                now,
            );
            let state = match &mutation {
                Some(mutation) => mutation.next,
                // Skip only happens for an existing, terminal record.
                None => current.unwrap_or(AttendanceState::CheckedOut),
            };
            match action {
                AttendanceAction::Created => created += 1,
                AttendanceAction::Updated => updated += 1,
                AttendanceAction::Skipped => {}
            }
            mutations.extend(mutation);
            recognized.push(RecognizedCamper {
                camper_id: m.camper_id,
                confidence: m.confidence,
                distance: m.distance,
                match_source: m.source,
                action,
                state,
            });
        }

        let result = AttendanceUpdateResult {
            success: true,
            request_id: event.request_id.clone(),
            activity_schedule_id: event.activity_schedule_id,
            created_count: created,
            updated_count: updated,
            unmatched_faces: unmatched as u32,
            conflicts_resolved: conflicts as u32,
            recognized_campers: recognized,
            timestamp: now,
        };
        let record = IdempotencyRecord {
            request_id: event.request_id.clone(),
            camp_id: event.camp_id,
            fingerprint: fingerprint.to_string(),
            result: result.clone(),
            recorded_at: now,
        };

        match self.store.commit(record, mutations).await? {
            CommitOutcome::Committed => {
                tracing::info!(
                    request_id = %event.request_id,
                    activity_schedule_id = %event.activity_schedule_id,
                    created,
                    updated,
                    unmatched,
                    "attendance reconciled"
                );
                Ok(Reconciled {
                    result,
                    replayed: false,
                })
            }
            // Another process committed the same request id first.
            CommitOutcome::Duplicate(existing) => Ok(self.replay(existing, fingerprint)),
        }
    }

    fn replay(&self, record: IdempotencyRecord, fingerprint: &str) -> Reconciled {
        if record.fingerprint != fingerprint {
            tracing::warn!(
                request_id = %record.request_id,
                "request id reused with a different payload; returning original outcome"
            );
        } else {
            tracing::debug!(request_id = %record.request_id, "duplicate delivery absorbed");
        }
        Reconciled {
            result: record.result,
            replayed: true,
        }
    }

    /// Resolve every face to a camper or a reason it stays unmatched.
    async fn resolve_faces(
        &self,
        event: &RecognitionEvent,
    ) -> Result<Vec<FaceResolution>, ReconcileError> {
        let needs_matching = event
            .recognized_faces
            .iter()
            .any(|f| matches!(f.query(), FaceQuery::Embedding(_)));
        let candidates: BTreeMap<CamperId, FaceEmbedding> = if needs_matching {
            self.store.camper_embeddings(event.group_id).await?
        } else {
            BTreeMap::new()
        };

        let resolutions = event
            .recognized_faces
            .iter()
            .enumerate()
            .map(|(face_index, face)| match face.query() {
                FaceQuery::PreMatched(camper_id) if face.confidence >= self.threshold => {
                    FaceResolution::Matched {
                        face_index,
                        camper_id,
                        confidence: face.confidence,
                        distance: None,
                        source: MatchSource::PreMatched,
                    }
                }
                FaceQuery::PreMatched(_) => FaceResolution::Unmatched {
                    face_index,
                    reason: UnmatchedReason::BelowThreshold,
                },
                FaceQuery::Embedding(probe) => {
                    match self.matcher.match_embedding(probe, &candidates, self.threshold) {
                        Ok(MatchResult::Matched {
                            camper_id,
                            confidence,
                            distance,
                        }) => FaceResolution::Matched {
                            face_index,
                            camper_id,
                            confidence,
                            distance: Some(distance),
                            source: MatchSource::Computed,
                        },
                        Ok(MatchResult::Unmatched { best_confidence }) => FaceResolution::Unmatched {
                            face_index,
                            reason: if best_confidence.is_some() {
                                UnmatchedReason::BelowThreshold
                            } else {
                                UnmatchedReason::NoCandidate
                            },
                        },
                        Err(err) => {
                            tracing::debug!(
                                request_id = %event.request_id,
                                face_index,
                                error = %err,
                                "face embedding not comparable"
                            );
                            FaceResolution::Unmatched {
                                face_index,
                                reason: UnmatchedReason::InvalidEmbedding,
                            }
                        }
                    }
                }
            })
            .collect();
        Ok(resolutions)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coordinator::tests::FakeEngine;
    use rollcall_core::{FaceMatcher, GroupId, RecognizedFace};
    use rollcall_store::MemoryStore;
    use std::time::Duration;

    pub(crate) const CAMP: CampId = CampId(7);
    pub(crate) const GROUP: GroupId = GroupId(3);
    pub(crate) const SCHEDULE: ActivityScheduleId = ActivityScheduleId(11);

    pub(crate) struct Fixture {
        pub store: Arc<MemoryStore>,
        pub engine: Arc<FakeEngine>,
        pub coordinator: Coordinator,
        pub reconciler: Arc<Reconciler>,
    }

    /// Camp 7 with campers 42 ([1,0,0]) and 43 ([0,1,0]) in group 3.
    pub(crate) async fn fixture(load: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.add_activity_schedule(SCHEDULE, CAMP);
        for (camper, values) in [(42, vec![1.0, 0.0, 0.0]), (43, vec![0.0, 1.0, 0.0])] {
            store.enroll(FaceEmbedding {
                camper_id: CamperId(camper),
                camp_id: CAMP,
                group_id: GROUP,
                values,
            });
        }
        let engine = Arc::new(FakeEngine::default());
        let coordinator = Coordinator::new(engine.clone(), Duration::from_secs(5));
        if load {
            coordinator.request_load(CAMP, false).await.unwrap();
        }
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            coordinator.clone(),
            Arc::new(FaceMatcher::default()),
            0.6,
            StaffId(0),
        ));
        Fixture {
            store,
            engine,
            coordinator,
            reconciler,
        }
    }

    pub(crate) fn embedding_face(values: Vec<f32>, confidence: f32) -> RecognizedFace {
        RecognizedFace {
            embedding: values,
            confidence,
            bounding_box: None,
            face_area: None,
            camper_id: None,
        }
    }

    pub(crate) fn prematched_face(camper: i64, confidence: f32) -> RecognizedFace {
        RecognizedFace {
            embedding: Vec::new(),
            confidence,
            bounding_box: None,
            face_area: None,
            camper_id: Some(CamperId(camper)),
        }
    }

    pub(crate) fn event(request_id: &str, faces: Vec<RecognizedFace>) -> RecognitionEvent {
        RecognitionEvent {
            request_id: RequestId::from(request_id),
            activity_schedule_id: SCHEDULE,
            group_id: GROUP,
            camp_id: CAMP,
            recognized_faces: faces,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_first_sighting_checks_in() {
        let fx = fixture(true).await;
        let out = fx
            .reconciler
            .reconcile(&event("r1", vec![prematched_face(42, 0.95)]), "f1")
            .await
            .unwrap();
        assert!(!out.replayed);
        assert!(out.result.success);
        assert_eq!(out.result.created_count, 1);
        assert_eq!(out.result.updated_count, 0);
        assert_eq!(out.result.recognized_campers[0].camper_id, CamperId(42));
        assert_eq!(out.result.recognized_campers[0].state, AttendanceState::CheckedIn);
        assert_eq!(
            fx.store.attendance_state(CamperId(42), SCHEDULE).await.unwrap(),
            Some(AttendanceState::CheckedIn)
        );
    }

    #[tokio::test]
    async fn test_replay_returns_cached_result_without_mutation() {
        let fx = fixture(true).await;
        let ev = event("r1", vec![prematched_face(42, 0.95)]);
        let first = fx.reconciler.reconcile(&ev, "f1").await.unwrap();
        let writes = fx.store.mutation_count();

        for _ in 0..5 {
            let again = fx.reconciler.reconcile(&ev, "f1").await.unwrap();
            assert!(again.replayed);
            assert_eq!(again.result, first.result);
        }
        assert_eq!(fx.store.mutation_count(), writes);
        assert_eq!(writes, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_apply_once() {
        let fx = fixture(true).await;
        let ev = event("r-dup", vec![embedding_face(vec![1.0, 0.0, 0.0], 0.9)]);
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let reconciler = fx.reconciler.clone();
                let ev = ev.clone();
                tokio::spawn(async move { reconciler.reconcile(&ev, "f").await })
            })
            .collect();
        let mut fresh = 0;
        for t in tasks {
            let out = t.await.unwrap().unwrap();
            assert_eq!(out.result.created_count, 1);
            if !out.replayed {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(fx.store.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_unloaded_camp_is_stale() {
        let fx = fixture(false).await;
        let err = fx
            .reconciler
            .reconcile(&event("r1", vec![prematched_face(42, 0.95)]), "f1")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::StaleIndex { camp_id: CAMP, status: IndexStatus::Unloaded }));
        assert_eq!(err.kind(), ErrorKind::StaleIndex);
        assert!(fx.store.find_outcome(&RequestId::from("r1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_index_checked_before_schedule_lookup() {
        let fx = fixture(false).await;
        let mut ev = event("r1", vec![]);
        ev.activity_schedule_id = ActivityScheduleId(999);
        let err = fx.reconciler.reconcile(&ev, "f").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleIndex);
    }

    #[tokio::test]
    async fn test_unknown_schedule_not_found() {
        let fx = fixture(true).await;
        let mut ev = event("r1", vec![prematched_face(42, 0.95)]);
        ev.activity_schedule_id = ActivityScheduleId(999);
        let err = fx.reconciler.reconcile(&ev, "f").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(fx.store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_schedule_from_other_camp_is_bad_request() {
        let fx = fixture(true).await;
        fx.store.add_activity_schedule(ActivityScheduleId(12), CampId(8));
        let mut ev = event("r1", vec![]);
        ev.activity_schedule_id = ActivityScheduleId(12);
        let err = fx.reconciler.reconcile(&ev, "f").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_conflicting_faces_keep_highest_confidence() {
        let fx = fixture(true).await;
        let out = fx
            .reconciler
            .reconcile(
                &event("r1", vec![prematched_face(5, 0.7), prematched_face(5, 0.9)]),
                "f",
            )
            .await
            .unwrap();
        assert_eq!(out.result.conflicts_resolved, 1);
        assert_eq!(out.result.unmatched_faces, 1);
        assert_eq!(out.result.recognized_campers.len(), 1);
        assert!((out.result.recognized_campers[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(fx.store.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_forward_transitions_and_no_regression() {
        let fx = fixture(true).await;
        let face = || vec![embedding_face(vec![0.0, 1.0, 0.0], 0.9)];

        let a = fx.reconciler.reconcile(&event("a", face()), "a").await.unwrap();
        assert_eq!((a.result.created_count, a.result.updated_count), (1, 0));

        let b = fx.reconciler.reconcile(&event("b", face()), "b").await.unwrap();
        assert_eq!((b.result.created_count, b.result.updated_count), (0, 1));
        assert_eq!(b.result.recognized_campers[0].state, AttendanceState::CheckedOut);

        let c = fx.reconciler.reconcile(&event("c", face()), "c").await.unwrap();
        assert_eq!((c.result.created_count, c.result.updated_count), (0, 0));
        assert_eq!(c.result.recognized_campers[0].action, AttendanceAction::Skipped);
        assert_eq!(
            fx.store.attendance_state(CamperId(43), SCHEDULE).await.unwrap(),
            Some(AttendanceState::CheckedOut)
        );
        assert_eq!(fx.store.history(CamperId(43), SCHEDULE).len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_face_does_not_abort_event() {
        let fx = fixture(true).await;
        let out = fx
            .reconciler
            .reconcile(
                &event(
                    "r1",
                    vec![
                        embedding_face(vec![f32::NAN, 0.0, 0.0], 0.9),
                        embedding_face(vec![1.0, 0.0], 0.9),
                        embedding_face(vec![1.0, 0.0, 0.0], 0.9),
                    ],
                ),
                "f",
            )
            .await
            .unwrap();
        assert_eq!(out.result.unmatched_faces, 2);
        assert_eq!(out.result.created_count, 1);
        assert_eq!(out.result.recognized_campers[0].camper_id, CamperId(42));
    }

    #[tokio::test]
    async fn test_low_confidence_faces_are_ignored() {
        let fx = fixture(true).await;
        let out = fx
            .reconciler
            .reconcile(
                &event(
                    "r1",
                    vec![
                        prematched_face(42, 0.3),
                        embedding_face(vec![0.0, 0.0, 1.0], 0.9),
                    ],
                ),
                "f",
            )
            .await
            .unwrap();
        assert_eq!(out.result.unmatched_faces, 2);
        assert_eq!(out.result.created_count, 0);
        assert_eq!(fx.store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_commits_nothing_and_allows_retry() {
        let fx = fixture(true).await;
        let ev = event("r1", vec![prematched_face(42, 0.95)]);

        fx.store.set_unavailable(Some("disk full"));
        let err = fx.reconciler.reconcile(&ev, "f").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.kind().is_retryable());
        assert_eq!(fx.store.mutation_count(), 0);

        fx.store.set_unavailable(None);
        let out = fx.reconciler.reconcile(&ev, "f").await.unwrap();
        assert!(!out.replayed);
        assert_eq!(out.result.created_count, 1);
    }

    #[tokio::test]
    async fn test_unloaded_camp_rejects_after_unload() {
        let fx = fixture(true).await;
        fx.coordinator.request_unload(CAMP).await.unwrap();
        let err = fx
            .reconciler
            .reconcile(&event("r1", vec![prematched_face(42, 0.95)]), "f")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::StaleIndex { .. }));
    }

    #[tokio::test]
    async fn test_failed_camp_is_stale() {
        let fx = fixture(true).await;
        fx.engine.fail_loads.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(fx.coordinator.request_load(CAMP, true).await.is_err());

        let err = fx
            .reconciler
            .reconcile(&event("r1", vec![prematched_face(42, 0.95)]), "f")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::StaleIndex { camp_id: CAMP, status: IndexStatus::Failed }));
        assert_eq!(fx.store.mutation_count(), 0);
        assert!(fx.store.find_outcome(&RequestId::from("r1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unloaded_camp_is_stale_even_with_invalid_values() {
        let fx = fixture(false).await;
        let err = fx
            .reconciler
            .reconcile(&event("r1", vec![prematched_face(42, 1.5)]), "f")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleIndex);
    }

    #[tokio::test]
    async fn test_invalid_values_on_loaded_camp_are_bad_request() {
        let fx = fixture(true).await;
        let err = fx
            .reconciler
            .reconcile(&event("r1", vec![prematched_face(42, 1.5)]), "f")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(fx.store.mutation_count(), 0);
        assert!(fx.store.find_outcome(&RequestId::from("r1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_distinct_requests_for_one_camper_are_serialized() {
        let fx = fixture(true).await;
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let reconciler = fx.reconciler.clone();
                let ev = event(&format!("r-{i}"), vec![prematched_face(42, 0.95)]);
                tokio::spawn(async move { reconciler.reconcile(&ev, "f").await })
            })
            .collect();

        let (mut created, mut updated) = (0, 0);
        for t in tasks {
            let out = t.await.unwrap().expect("no stale write under concurrency");
            assert!(!out.replayed);
            created += out.result.created_count;
            updated += out.result.updated_count;
        }
        assert_eq!((created, updated), (1, 1));

        let history = fx.store.history(CamperId(42), SCHEDULE);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, rollcall_core::attendance::EventType::CheckIn);
        assert_eq!(history[1].event_type, rollcall_core::attendance::EventType::CheckOut);
        assert_eq!(
            fx.store.attendance_state(CamperId(42), SCHEDULE).await.unwrap(),
            Some(AttendanceState::CheckedOut)
        );
    }
}
