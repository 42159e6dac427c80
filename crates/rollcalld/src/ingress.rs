//! Webhook entry point: decode, reconcile, publish.

use crate::broadcaster::{Broadcaster, ServerMessage, Topic};
use crate::error::{ErrorBody, ErrorKind};
use crate::reconciler::Reconciler;
use axum::http::StatusCode;
use rollcall_core::{ActivityScheduleId, AttendanceUpdateResult, RecognitionEvent, RequestId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Response body of the recognition webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResult {
    #[serde(flatten)]
    pub update: AttendanceUpdateResult,
    /// True only when the live publish itself succeeded.
    pub broadcast_sent: bool,
    pub replayed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl HandlerResult {
    fn failed(update: AttendanceUpdateResult, error: ErrorBody) -> Self {
        Self {
            update,
            broadcast_sent: false,
            replayed: false,
            error: Some(error),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.error
            .as_ref()
            .map(|e| e.kind.status())
            .unwrap_or(StatusCode::OK)
    }
}

/// Hex SHA-256 of the raw request body.
pub fn fingerprint(raw: &[u8]) -> String {
    format!("{:x}", Sha256::digest(raw))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    activity_schedule_id: Option<i64>,
}

/// Pull identifiers out of a payload that failed validation so the error
/// response can still be correlated.
fn peek_ids(raw: &[u8]) -> (RequestId, ActivityScheduleId) {
    let envelope: Envelope = serde_json::from_slice(raw).unwrap_or_default();
    (
        RequestId(envelope.request_id.unwrap_or_default()),
        ActivityScheduleId(envelope.activity_schedule_id.unwrap_or_default()),
    )
}

pub struct WebhookIngress {
    reconciler: Arc<Reconciler>,
    broadcaster: Arc<Broadcaster>,
}

impl WebhookIngress {
    pub fn new(reconciler: Arc<Reconciler>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            reconciler,
            broadcaster,
        }
    }

    pub async fn handle_webhook(&self, raw: &[u8]) -> HandlerResult {
        let event = match RecognitionEvent::decode(raw) {
            Ok(event) => event,
            Err(err) => {
                let (request_id, schedule_id) = peek_ids(raw);
                tracing::warn!(request_id = %request_id, error = %err, "malformed recognition webhook");
                return HandlerResult::failed(
                    AttendanceUpdateResult::rejected(request_id, schedule_id),
                    ErrorBody::new(ErrorKind::BadRequest, err.to_string()),
                );
            }
        };

        let reconciled = match self.reconciler.reconcile(&event, &fingerprint(raw)).await {
            Ok(reconciled) => reconciled,
            Err(err) => {
                let kind = err.kind();
                tracing::warn!(
                    request_id = %event.request_id,
                    camp_id = %event.camp_id,
                    ?kind,
                    error = %err,
                    "recognition event rejected"
                );
                return HandlerResult::failed(
                    AttendanceUpdateResult::rejected(
                        event.request_id.clone(),
                        event.activity_schedule_id,
                    ),
                    ErrorBody::new(kind, err.to_string()),
                );
            }
        };

        // Replays were already published when first applied.
        let broadcast_sent = if reconciled.replayed {
            false
        } else {
            let topic = Topic::attendance(event.activity_schedule_id);
            let message = ServerMessage::AttendanceUpdated(reconciled.result.clone());
            match self.broadcaster.publish(&topic, &message).await {
                Ok(_) => true,
                Err(err) => {
                    tracing::warn!(request_id = %event.request_id, %topic, error = %err, "live publish failed");
                    false
                }
            }
        };

        HandlerResult {
            update: reconciled.result,
            broadcast_sent,
            replayed: reconciled.replayed,
            error: None,
        }
    }
}
