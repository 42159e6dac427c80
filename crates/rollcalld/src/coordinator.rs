//! Embedding index coordination.
//!
//! Each camp is driven by its own command task: load and unload requests for
//! one camp queue up and run strictly one after another, while different camps
//! proceed in parallel. The task owns the transition, so a caller that stops
//! waiting cannot strand a camp in `Loading`.

use crate::engine::EngineControl;
use chrono::{DateTime, Utc};
use rollcall_core::{CampId, GroupId, IndexStatus, LoadedIndexState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const CAMP_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error("recognition engine unavailable for camp {camp_id}: {reason}")]
    EngineUnavailable { camp_id: CampId, reason: String },
    #[error("coordinator task for camp {0} stopped")]
    Stopped(CampId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub camp_id: CampId,
    pub face_count: u32,
    pub group_ids: BTreeSet<GroupId>,
    /// The index was already loaded and no reload was forced.
    pub already_loaded: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadOutcome {
    pub camp_id: CampId,
    pub released_faces: u32,
    pub already_unloaded: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    pub loaded_camp_count: usize,
    pub failed_camp_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_error: Option<String>,
}

/// Camp and group lifecycle changes coming from the wider backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CampLifecycle {
    #[serde(rename_all = "camelCase")]
    CampActivated {
        camp_id: CampId,
        group_ids: BTreeSet<GroupId>,
    },
    #[serde(rename_all = "camelCase")]
    GroupActivated { camp_id: CampId, group_id: GroupId },
    #[serde(rename_all = "camelCase")]
    GroupDeactivated { camp_id: CampId, group_id: GroupId },
    #[serde(rename_all = "camelCase")]
    CampDeactivated { camp_id: CampId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum LifecycleAction {
    Loaded(LoadOutcome),
    Unloaded(UnloadOutcome),
    /// Desired groups recorded; the camp is not loaded so nothing was sent.
    #[serde(rename_all = "camelCase")]
    GroupsRecorded {
        camp_id: CampId,
        group_ids: BTreeSet<GroupId>,
    },
}

enum CampCommand {
    Load {
        force_reload: bool,
        reply: oneshot::Sender<Result<LoadOutcome, CoordinatorError>>,
    },
    Unload {
        reply: oneshot::Sender<Result<UnloadOutcome, CoordinatorError>>,
    },
    /// Bring a loaded index in line with the desired groups.
    Reconfigure {
        reply: oneshot::Sender<Result<LifecycleAction, CoordinatorError>>,
    },
}

struct Shared {
    engine: Arc<dyn EngineControl>,
    timeout: Duration,
    states: RwLock<HashMap<CampId, LoadedIndexState>>,
    desired_groups: Mutex<HashMap<CampId, BTreeSet<GroupId>>>,
    /// Groups sent with the last successful load, per camp.
    applied_groups: Mutex<HashMap<CampId, BTreeSet<GroupId>>>,
}

/// Clone-safe handle to the coordinator.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
    camps: Arc<Mutex<HashMap<CampId, mpsc::Sender<CampCommand>>>>,
}

impl Coordinator {
    pub fn new(engine: Arc<dyn EngineControl>, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                timeout,
                states: RwLock::new(HashMap::new()),
                desired_groups: Mutex::new(HashMap::new()),
                applied_groups: Mutex::new(HashMap::new()),
            }),
            camps: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read-only snapshot. Camps never seen before report `Unloaded`.
    pub fn state(&self, camp_id: CampId) -> LoadedIndexState {
        self.shared.state(camp_id)
    }

    /// Load (or, with `force_reload`, reload) the camp's index.
    pub async fn request_load(
        &self,
        camp_id: CampId,
        force_reload: bool,
    ) -> Result<LoadOutcome, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            camp_id,
            CampCommand::Load {
                force_reload,
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| CoordinatorError::Stopped(camp_id))?
    }

    pub async fn request_unload(&self, camp_id: CampId) -> Result<UnloadOutcome, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.submit(camp_id, CampCommand::Unload { reply }).await?;
        rx.await.map_err(|_| CoordinatorError::Stopped(camp_id))?
    }

    /// Aggregate local index state with the engine's own health report.
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let (loaded, failed) = {
            let states = self.shared.states.read().unwrap_or_else(PoisonError::into_inner);
            states.values().fold((0, 0), |(l, f), s| match s.status {
                IndexStatus::Loaded => (l + 1, f),
                IndexStatus::Failed => (l, f + 1),
                _ => (l, f),
            })
        };

        let engine = self.shared.engine.clone();
        match tokio::time::timeout(self.shared.timeout, engine.health_check()).await {
            Ok(Ok(health)) => {
                if health.loaded_camp_count as usize != loaded {
                    tracing::warn!(
                        local = loaded,
                        engine = health.loaded_camp_count,
                        "loaded camp count differs from engine report"
                    );
                }
                HealthSnapshot {
                    is_healthy: health.healthy,
                    loaded_camp_count: loaded,
                    failed_camp_count: failed,
                    model_name: Some(health.model_name),
                    engine_error: None,
                }
            }
            Ok(Err(err)) => HealthSnapshot {
                is_healthy: false,
                loaded_camp_count: loaded,
                failed_camp_count: failed,
                model_name: None,
                engine_error: Some(err.to_string()),
            },
            Err(_) => HealthSnapshot {
                is_healthy: false,
                loaded_camp_count: loaded,
                failed_camp_count: failed,
                model_name: None,
                engine_error: Some(format!("health check timed out after {:?}", self.shared.timeout)),
            },
        }
    }

    /// Reload the camp if it is loaded with groups other than the desired
    /// ones. Decided inside the camp's task, after any queued transition.
    pub async fn request_reconfigure(
        &self,
        camp_id: CampId,
    ) -> Result<LifecycleAction, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.submit(camp_id, CampCommand::Reconfigure { reply }).await?;
        rx.await.map_err(|_| CoordinatorError::Stopped(camp_id))?
    }

    /// React to a camp or group lifecycle change.
    pub async fn apply_lifecycle(
        &self,
        event: CampLifecycle,
    ) -> Result<LifecycleAction, CoordinatorError> {
        tracing::info!(?event, "camp lifecycle event");
        match event {
            CampLifecycle::CampActivated { camp_id, group_ids } => {
                self.shared.set_desired(camp_id, |groups| *groups = group_ids);
                self.request_load(camp_id, false)
                    .await
                    .map(LifecycleAction::Loaded)
            }
            CampLifecycle::GroupActivated { camp_id, group_id } => {
                self.shared.set_desired(camp_id, |groups| {
                    groups.insert(group_id);
                });
                self.request_reconfigure(camp_id).await
            }
            CampLifecycle::GroupDeactivated { camp_id, group_id } => {
                self.shared.set_desired(camp_id, |groups| {
                    groups.remove(&group_id);
                });
                self.request_reconfigure(camp_id).await
            }
            CampLifecycle::CampDeactivated { camp_id } => self
                .request_unload(camp_id)
                .await
                .map(LifecycleAction::Unloaded),
        }
    }

    async fn submit(&self, camp_id: CampId, command: CampCommand) -> Result<(), CoordinatorError> {
        let tx = self.camp_sender(camp_id);
        tx.send(command)
            .await
            .map_err(|_| CoordinatorError::Stopped(camp_id))
    }

    fn camp_sender(&self, camp_id: CampId) -> mpsc::Sender<CampCommand> {
        let mut camps = self.camps.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = camps.get(&camp_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(CAMP_QUEUE_DEPTH);
        tokio::spawn(run_camp(self.shared.clone(), camp_id, rx));
        camps.insert(camp_id, tx.clone());
        tx
    }
}

/// Command loop for one camp. Ends when every coordinator handle is dropped.
async fn run_camp(shared: Arc<Shared>, camp_id: CampId, mut rx: mpsc::Receiver<CampCommand>) {
    tracing::debug!(%camp_id, "camp coordinator started");
    while let Some(command) = rx.recv().await {
        match command {
            CampCommand::Load {
                force_reload,
                reply,
            } => {
                let result = shared.load(camp_id, force_reload).await;
                let _ = reply.send(result);
            }
            CampCommand::Unload { reply } => {
                let result = shared.unload(camp_id).await;
                let _ = reply.send(result);
            }
            CampCommand::Reconfigure { reply } => {
                let result = shared.reconfigure(camp_id).await;
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(%camp_id, "camp coordinator exiting");
}

impl Shared {
    fn state(&self, camp_id: CampId) -> LoadedIndexState {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&camp_id)
            .cloned()
            .unwrap_or_else(|| LoadedIndexState::unloaded(camp_id))
    }

    fn update(&self, camp_id: CampId, f: impl FnOnce(&mut LoadedIndexState)) -> LoadedIndexState {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(camp_id)
            .or_insert_with(|| LoadedIndexState::unloaded(camp_id));
        f(state);
        state.clone()
    }

    fn set_desired(&self, camp_id: CampId, f: impl FnOnce(&mut BTreeSet<GroupId>)) {
        let mut desired = self
            .desired_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(desired.entry(camp_id).or_default());
    }

    fn desired(&self, camp_id: CampId) -> BTreeSet<GroupId> {
        self.desired_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&camp_id)
            .cloned()
            .unwrap_or_default()
    }

    fn applied(&self, camp_id: CampId) -> BTreeSet<GroupId> {
        self.applied_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&camp_id)
            .cloned()
            .unwrap_or_default()
    }

    fn set_applied(&self, camp_id: CampId, groups: Option<BTreeSet<GroupId>>) {
        let mut applied = self
            .applied_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match groups {
            Some(groups) => applied.insert(camp_id, groups),
            None => applied.remove(&camp_id),
        };
    }

    async fn reconfigure(&self, camp_id: CampId) -> Result<LifecycleAction, CoordinatorError> {
        if self.state(camp_id).status == IndexStatus::Loaded {
            self.load(camp_id, false).await.map(LifecycleAction::Loaded)
        } else {
            Ok(LifecycleAction::GroupsRecorded {
                camp_id,
                group_ids: self.desired(camp_id),
            })
        }
    }

    fn fail(&self, camp_id: CampId, reason: String) -> CoordinatorError {
        tracing::warn!(%camp_id, %reason, "index transition failed");
        self.set_applied(camp_id, None);
        self.update(camp_id, |s| s.mark_failed(reason.clone()));
        CoordinatorError::EngineUnavailable { camp_id, reason }
    }

    async fn load(&self, camp_id: CampId, force_reload: bool) -> Result<LoadOutcome, CoordinatorError> {
        let current = self.state(camp_id);
        let desired = self.desired(camp_id);
        let loaded = current.status == IndexStatus::Loaded;
        let in_sync = self.applied(camp_id) == desired;
        if loaded && in_sync && !force_reload {
            tracing::debug!(%camp_id, face_count = current.face_count, "index already loaded");
            return Ok(LoadOutcome {
                camp_id,
                face_count: current.face_count,
                group_ids: current.group_ids,
                already_loaded: true,
                timestamp: Utc::now(),
            });
        }

        // Replacing a loaded index always forces the engine to reload.
        let force_reload = force_reload || loaded;
        self.update(camp_id, |s| s.transition(IndexStatus::Loading));
        let groups: Vec<GroupId> = desired.iter().copied().collect();
        tracing::info!(%camp_id, groups = groups.len(), force_reload, "loading index");

        // Run the engine call in its own task so a panic surfaces as a JoinError.
        let engine = self.engine.clone();
        let mut call =
            tokio::spawn(async move { engine.load_index(camp_id, &groups, force_reload).await });

        let response = match tokio::time::timeout(self.timeout, &mut call).await {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(err))) => return Err(self.fail(camp_id, err.to_string())),
            Ok(Err(join)) => return Err(self.fail(camp_id, format!("engine call aborted: {join}"))),
            Err(_) => {
                call.abort();
                return Err(self.fail(
                    camp_id,
                    format!("load timed out after {:?}", self.timeout),
                ));
            }
        };

        if !response.success {
            let reason = response
                .message
                .unwrap_or_else(|| "engine reported load failure".to_string());
            return Err(self.fail(camp_id, reason));
        }

        self.set_applied(camp_id, Some(desired));
        let group_ids: BTreeSet<GroupId> = response.groups.into_iter().collect();
        let state = self.update(camp_id, |s| {
            s.mark_loaded(group_ids.clone(), response.face_count)
        });
        tracing::info!(
            %camp_id,
            face_count = state.face_count,
            groups = state.group_ids.len(),
            "index loaded"
        );

        Ok(LoadOutcome {
            camp_id,
            face_count: state.face_count,
            group_ids,
            already_loaded: false,
            timestamp: response.timestamp.unwrap_or(state.last_transition),
        })
    }

    async fn unload(&self, camp_id: CampId) -> Result<UnloadOutcome, CoordinatorError> {
        let current = self.state(camp_id);
        if current.status == IndexStatus::Unloaded {
            return Ok(UnloadOutcome {
                camp_id,
                released_faces: 0,
                already_unloaded: true,
                timestamp: Utc::now(),
            });
        }

        self.update(camp_id, |s| s.transition(IndexStatus::Unloading));
        tracing::info!(%camp_id, "unloading index");

        let engine = self.engine.clone();
        let mut call = tokio::spawn(async move { engine.unload_index(camp_id).await });

        let response = match tokio::time::timeout(self.timeout, &mut call).await {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(err))) => return Err(self.fail(camp_id, err.to_string())),
            Ok(Err(join)) => return Err(self.fail(camp_id, format!("engine call aborted: {join}"))),
            Err(_) => {
                call.abort();
                return Err(self.fail(
                    camp_id,
                    format!("unload timed out after {:?}", self.timeout),
                ));
            }
        };

        if !response.success {
            let reason = response
                .message
                .unwrap_or_else(|| "engine reported unload failure".to_string());
            return Err(self.fail(camp_id, reason));
        }

        self.set_applied(camp_id, None);
        let state = self.update(camp_id, |s| s.mark_unloaded());
        tracing::info!(%camp_id, released_faces = response.face_count, "index unloaded");

        Ok(UnloadOutcome {
            camp_id,
            released_faces: response.face_count,
            already_unloaded: false,
            timestamp: state.last_transition,
        })
    }
}
