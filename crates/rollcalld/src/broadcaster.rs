//! Live fan-out of attendance results to WebSocket subscribers.
//!
//! Connections register once and then subscribe to topics. Publishing is
//! best effort: a closed connection is skipped and pruned, never retried.

use rollcall_core::{ActivityScheduleId, AttendanceUpdateResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("broadcaster is shut down")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Subscription channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn attendance(activity_schedule_id: ActivityScheduleId) -> Self {
        Self(format!("attendance/{activity_schedule_id}"))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    AttendanceUpdated(AttendanceUpdateResult),
    #[serde(rename_all = "camelCase")]
    Subscribed { activity_schedule_id: ActivityScheduleId },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { activity_schedule_id: ActivityScheduleId },
    Pong,
    Error { message: String },
}

/// Messages accepted from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SubscribeToActivitySchedule { activity_schedule_id: ActivityScheduleId },
    #[serde(rename_all = "camelCase")]
    UnsubscribeFromActivitySchedule { activity_schedule_id: ActivityScheduleId },
    Ping,
}

struct Connection {
    tx: mpsc::UnboundedSender<String>,
    topics: HashSet<Topic>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<Uuid, Connection>,
    topics: HashMap<Topic, HashSet<Uuid>>,
}

impl Registry {
    fn detach(&mut self, id: &Uuid, topic: &Topic) {
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(id);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}

pub struct Broadcaster {
    registry: RwLock<Registry>,
    closed: AtomicBool,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a connection. Messages for it arrive on the returned receiver.
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.write().await.connections.insert(
            id,
            Connection {
                tx,
                topics: HashSet::new(),
            },
        );
        tracing::info!(connection_id = %id, "subscriber connected");
        (id, rx)
    }

    /// Drop a connection and every subscription it held.
    pub async fn unregister(&self, id: &Uuid) {
        let mut registry = self.registry.write().await;
        if let Some(conn) = registry.connections.remove(id) {
            for topic in &conn.topics {
                registry.detach(id, topic);
            }
            tracing::info!(connection_id = %id, "subscriber disconnected");
        }
    }

    /// Returns false for an unknown connection.
    pub async fn subscribe(&self, id: &Uuid, topic: Topic) -> bool {
        let mut registry = self.registry.write().await;
        let Some(conn) = registry.connections.get_mut(id) else {
            return false;
        };
        conn.topics.insert(topic.clone());
        tracing::debug!(connection_id = %id, %topic, "subscribed");
        registry.topics.entry(topic).or_default().insert(*id);
        true
    }

    pub async fn unsubscribe(&self, id: &Uuid, topic: &Topic) {
        let mut registry = self.registry.write().await;
        if let Some(conn) = registry.connections.get_mut(id) {
            conn.topics.remove(topic);
        }
        registry.detach(id, topic);
    }

    /// Send `message` to every subscriber of `topic`.
    ///
    /// Returns how many connections accepted it. Connections whose receiver
    /// is gone are removed.
    pub async fn publish(&self, topic: &Topic, message: &ServerMessage) -> Result<usize, BroadcastError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BroadcastError::Closed);
        }
        let json = serde_json::to_string(message)?;

        let mut dead = Vec::new();
        let delivered = {
            let registry = self.registry.read().await;
            let Some(members) = registry.topics.get(topic) else {
                return Ok(0);
            };
            let mut delivered = 0;
            for id in members {
                match registry.connections.get(id) {
                    Some(conn) if conn.tx.send(json.clone()).is_ok() => delivered += 1,
                    _ => dead.push(*id),
                }
            }
            delivered
        };

        for id in &dead {
            tracing::debug!(connection_id = %id, "pruning closed subscriber");
            self.unregister(id).await;
        }
        tracing::debug!(%topic, delivered, "published");
        Ok(delivered)
    }

    /// Send a message to a single connection.
    pub async fn send_to(&self, id: &Uuid, message: &ServerMessage) -> Result<bool, BroadcastError> {
        let json = serde_json::to_string(message)?;
        let registry = self.registry.read().await;
        Ok(registry
            .connections
            .get(id)
            .map(|conn| conn.tx.send(json).is_ok())
            .unwrap_or(false))
    }

    /// Stop accepting publishes and drop every connection.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut registry = self.registry.write().await;
        let count = registry.connections.len();
        registry.connections.clear();
        registry.topics.clear();
        tracing::info!(connections = count, "broadcaster shut down");
    }

    #[cfg(test)]
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry
            .read()
            .await
            .topics
            .get(topic)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::RequestId;

    fn update(schedule: i64) -> ServerMessage {
        ServerMessage::AttendanceUpdated(AttendanceUpdateResult::rejected(
            RequestId::from("r1"),
            ActivityScheduleId(schedule),
        ))
    }

    #[tokio::test]
    async fn test_publish_reaches_only_topic_subscribers() {
        let hub = Broadcaster::new();
        let (a, mut rx_a) = hub.register().await;
        let (_b, mut rx_b) = hub.register().await;
        assert!(hub.subscribe(&a, Topic::attendance(ActivityScheduleId(11))).await);

        let sent = hub
            .publish(&Topic::attendance(ActivityScheduleId(11)), &update(11))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        let json: serde_json::Value = serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(json["type"], "attendanceUpdated");
        assert_eq!(json["data"]["activityScheduleId"], 11);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_removes_subscriptions() {
        let hub = Broadcaster::new();
        let topic = Topic::attendance(ActivityScheduleId(3));
        let (a, _rx) = hub.register().await;
        hub.subscribe(&a, topic.clone()).await;
        assert_eq!(hub.subscriber_count(&topic).await, 1);

        hub.unregister(&a).await;
        assert_eq!(hub.subscriber_count(&topic).await, 0);
        assert_eq!(hub.connection_count().await, 0);
        assert!(!hub.subscribe(&a, topic).await);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_pruned() {
        let hub = Broadcaster::new();
        let topic = Topic::attendance(ActivityScheduleId(5));
        let (a, rx) = hub.register().await;
        hub.subscribe(&a, topic.clone()).await;
        drop(rx);

        assert_eq!(hub.publish(&topic, &update(5)).await.unwrap(), 0);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let hub = Broadcaster::new();
        hub.shutdown().await;
        let err = hub
            .publish(&Topic::attendance(ActivityScheduleId(1)), &ServerMessage::Pong)
            .await
            .unwrap_err();
        assert!(matches!(err, BroadcastError::Closed));
    }

    #[test]
    fn test_client_message_wire_shape() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "subscribeToActivitySchedule", "data": {"activityScheduleId": 11}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubscribeToActivitySchedule {
                activity_schedule_id: ActivityScheduleId(11)
            }
        );
        let ping: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping);
        assert_eq!(
            serde_json::to_value(ServerMessage::Pong).unwrap(),
            serde_json::json!({"type": "pong"})
        );
    }
}
