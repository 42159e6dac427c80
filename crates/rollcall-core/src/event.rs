//! Inbound recognition events as posted by the engine's webhook.

use crate::types::{ActivityScheduleId, BoundingBox, CampId, CamperId, GroupId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl EventError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// One webhook delivery: the faces the engine saw for one activity schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionEvent {
    pub request_id: RequestId,
    pub activity_schedule_id: ActivityScheduleId,
    pub group_id: GroupId,
    pub camp_id: CampId,
    #[serde(default)]
    pub recognized_faces: Vec<RecognizedFace>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizedFace {
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_area: Option<f32>,
    /// Set when the engine already resolved the identity itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camper_id: Option<CamperId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
}

/// How a face's identity is to be obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaceQuery<'a> {
    /// The engine supplied the camper id; no matching needed.
    PreMatched(CamperId),
    /// The raw embedding must be resolved by the matcher.
    Embedding(&'a [f32]),
}

impl RecognizedFace {
    pub fn query(&self) -> FaceQuery<'_> {
        match self.camper_id {
            Some(id) => FaceQuery::PreMatched(id),
            None => FaceQuery::Embedding(&self.embedding),
        }
    }
}

impl RecognitionEvent {
    /// Decode a raw webhook body. Field values are checked separately by
    /// [`validate`](Self::validate), once the camp is known to accept events.
    pub fn decode(raw: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Value checks on ids and confidences. Corrupt embeddings are not
    /// rejected here: they are resolved per face as unmatched.
    pub fn validate(&self) -> Result<(), EventError> {
        let request_id = self.request_id.0.trim();
        if request_id.is_empty() {
            return Err(EventError::invalid("requestId", "must not be empty"));
        }
        if request_id.len() > MAX_REQUEST_ID_LEN {
            return Err(EventError::invalid(
                "requestId",
                format!("longer than {MAX_REQUEST_ID_LEN} characters"),
            ));
        }
        if self.camp_id.0 <= 0 {
            return Err(EventError::invalid("campId", "must be positive"));
        }
        if self.group_id.0 <= 0 {
            return Err(EventError::invalid("groupId", "must be positive"));
        }
        if self.activity_schedule_id.0 <= 0 {
            return Err(EventError::invalid("activityScheduleId", "must be positive"));
        }
        for (i, face) in self.recognized_faces.iter().enumerate() {
            if !face.confidence.is_finite() || !(0.0..=1.0).contains(&face.confidence) {
                return Err(EventError::invalid(
                    "recognizedFaces.confidence",
                    format!("face {i}: {} is outside [0, 1]", face.confidence),
                ));
            }
            if let Some(id) = face.camper_id {
                if id.0 <= 0 {
                    return Err(EventError::invalid(
                        "recognizedFaces.camperId",
                        format!("face {i}: must be positive"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "requestId": "r1",
        "activityScheduleId": 11,
        "groupId": 3,
        "campId": 7,
        "recognizedFaces": [
            {
                "embedding": [0.1, 0.2, 0.3],
                "confidence": 0.95,
                "boundingBox": {"x": 10, "y": 20, "w": 64, "h": 64},
                "faceArea": 4096
            },
            {"confidence": 0.88, "camperId": 42}
        ],
        "metadata": {
            "timestamp": "2026-07-01T09:30:00Z",
            "processedBy": "engine-a",
            "source": "gate-camera",
            "engineVersion": "2.4.1"
        }
    }"#;

    #[test]
    fn test_decode_sample_payload() {
        let event = RecognitionEvent::decode(SAMPLE.as_bytes()).unwrap();
        event.validate().unwrap();
        assert_eq!(event.request_id, RequestId::from("r1"));
        assert_eq!(event.camp_id, CampId(7));
        assert_eq!(event.recognized_faces.len(), 2);
        assert_eq!(event.metadata.source.as_deref(), Some("gate-camera"));
        assert!(matches!(
            event.recognized_faces[0].query(),
            FaceQuery::Embedding(e) if e.len() == 3
        ));
        assert_eq!(
            event.recognized_faces[1].query(),
            FaceQuery::PreMatched(CamperId(42))
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            RecognitionEvent::decode(b"{not json"),
            Err(EventError::Malformed(_))
        ));
        assert!(matches!(
            RecognitionEvent::decode(br#"{"requestId": "r1"}"#),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn test_validate_rejects_blank_request_id() {
        let raw = SAMPLE.replace("\"r1\"", "\"  \"");
        let event = RecognitionEvent::decode(raw.as_bytes()).unwrap();
        let err = event.validate().unwrap_err();
        assert!(matches!(err, EventError::Invalid { field: "requestId", .. }));
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        let raw = SAMPLE.replace("0.95", "1.5");
        let event = RecognitionEvent::decode(raw.as_bytes()).unwrap();
        let err = event.validate().unwrap_err();
        assert!(err.to_string().contains("outside [0, 1]"));
    }

    #[test]
    fn test_empty_face_list_is_valid() {
        let raw = r#"{"requestId":"r2","activityScheduleId":1,"groupId":1,"campId":1}"#;
        let event = RecognitionEvent::decode(raw.as_bytes()).unwrap();
        assert!(event.recognized_faces.is_empty());
        assert!(event.validate().is_ok());
    }
}
