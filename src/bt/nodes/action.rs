//! Stateful MQTT action node (§4.5.1).
//!
//! Grounded on `MqttActionNode`
//! (`original_source/BT_Controller/include/bt/mqtt_action_node.h` and its
//! `.cpp`): `onStart` publishes a request and returns `RUNNING`; `callback`
//! drives the node to its terminal status when a response arrives whose
//! `Uuid` matches the one the node is currently awaiting; `onHalted`
//! publishes a halt/unregister message if the node declares a halt topic.
//! `BT::StatefulActionNode`'s two-phase `onStart`/`onRunning` split collapses
//! to a single `tick()` here, gated on whether the node has already started
//! (see DESIGN.md's note on translating "wait for response" into an
//! explicit finite-state machine).

use crate::bt::nodes::context::NodeContext;
use crate::bt::tree::{Node, NodeStatus};
use crate::interface_cache::Direction;
use crate::mqtt::client::MessageProps;
use crate::mqtt::distributor::NodeSubscriber;
use crate::mqtt::topic::TopicDescriptor;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

/// Specialises a [`StatefulMqttAction`]'s outgoing request payload. The
/// default (`GenericMessage`) only ever sends `{Uuid}`; `MoveToPosition` and
/// `Refill` override this to add their extra fields, exactly as the C++
/// subclasses only override `createMessage()`/`initializeTopicsFromAAS()`.
pub trait MessageBuilder: Send + Sync {
    /// Interaction name (lowercased at lookup time) this action resolves
    /// against the interface cache, e.g. `"occupy"`, `"moveto"`.
    fn interaction(&self) -> &str;

    fn build(&self, ctx: &NodeContext, asset_id: &str, uuid: &str) -> Value;
}

pub struct GenericMessage {
    pub interaction: String,
}

impl MessageBuilder for GenericMessage {
    fn interaction(&self) -> &str {
        &self.interaction
    }

    fn build(&self, _ctx: &NodeContext, _asset_id: &str, uuid: &str) -> Value {
        json!({ "Uuid": uuid })
    }
}

/// `MoveToPosition`: translates a station-name input to an integer
/// `TargetPosition` via the blackboard's station table.
pub struct MoveToPositionMessage {
    pub interaction: String,
}

impl MessageBuilder for MoveToPositionMessage {
    fn interaction(&self) -> &str {
        &self.interaction
    }

    fn build(&self, ctx: &NodeContext, asset_id: &str, uuid: &str) -> Value {
        let target_position = ctx.blackboard.station_position(asset_id);
        json!({ "Uuid": uuid, "TargetPosition": target_position })
    }
}

/// `Refill`: also tracks a live weight value fed by a third subscription
/// (`callback` for the `"weight"` key updates it independently of the
/// request/response pair that drives node status).
pub struct RefillMessage {
    pub interaction: String,
    pub current_weight: Mutex<Option<f64>>,
}

impl RefillMessage {
    pub fn new(interaction: impl Into<String>) -> Self {
        Self {
            interaction: interaction.into(),
            current_weight: Mutex::new(None),
        }
    }

    pub fn observe_weight(&self, weight: f64) {
        *self.current_weight.lock().expect("weight mutex poisoned") = Some(weight);
    }

    pub fn current_weight(&self) -> Option<f64> {
        *self.current_weight.lock().expect("weight mutex poisoned")
    }
}

impl MessageBuilder for RefillMessage {
    fn interaction(&self) -> &str {
        &self.interaction
    }

    fn build(&self, _ctx: &NodeContext, _asset_id: &str, uuid: &str) -> Value {
        json!({ "Uuid": uuid, "CurrentWeight": self.current_weight() })
    }
}

struct ActionTopics {
    request: TopicDescriptor,
    response: TopicDescriptor,
    halt: Option<TopicDescriptor>,
}

pub struct StatefulMqttAction<B: MessageBuilder> {
    ctx: Arc<NodeContext>,
    asset_port: String,
    builder: B,
    topics: OnceCell<Option<ActionTopics>>,
    status: Mutex<NodeStatus>,
    current_uuid: Mutex<Option<String>>,
}

impl<B: MessageBuilder> StatefulMqttAction<B> {
    pub fn new(ctx: Arc<NodeContext>, asset_port: impl Into<String>, builder: B) -> Self {
        Self {
            ctx,
            asset_port: asset_port.into(),
            builder,
            topics: OnceCell::new(),
            status: Mutex::new(NodeStatus::Idle),
            current_uuid: Mutex::new(None),
        }
    }

    fn asset_id(&self) -> Option<String> {
        self.ctx.blackboard.get_str(&self.asset_port)
    }

    /// `initialize_topics_from_aas()`: idempotent, resolves this node's
    /// request/response/halt topics once on first tick.
    async fn topics(&self) -> Option<&ActionTopics> {
        self.topics
            .get_or_init(|| async {
                let asset_id = self.asset_id()?;
                let request = self
                    .ctx
                    .resolve_topic(&asset_id, self.builder.interaction(), Direction::Input)
                    .await?;
                let response = self
                    .ctx
                    .resolve_topic(&asset_id, self.builder.interaction(), Direction::Output)
                    .await?;
                let halt = self
                    .ctx
                    .resolve_topic(&asset_id, "halt", Direction::Input)
                    .await;
                Some(ActionTopics {
                    request,
                    response,
                    halt,
                })
            })
            .await
            .as_ref()
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.lock().expect("status mutex poisoned") = status;
    }

    fn status(&self) -> NodeStatus {
        *self.status.lock().expect("status mutex poisoned")
    }
}

#[async_trait]
impl<B: MessageBuilder + 'static> Node for StatefulMqttAction<B> {
    async fn tick(&self) -> NodeStatus {
        if self.status() != NodeStatus::Idle {
            return self.status();
        }

        let Some(topics) = self.topics().await else {
            warn!(port = %self.asset_port, "action node could not resolve topics from AAS");
            return NodeStatus::Failure;
        };

        let Some(asset_id) = self.asset_id() else {
            return NodeStatus::Failure;
        };

        let uuid = self
            .ctx
            .blackboard
            .get_str("Uuid")
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        *self.current_uuid.lock().expect("uuid mutex poisoned") = Some(uuid.clone());

        let message = self.builder.build(&self.ctx, &asset_id, &uuid);
        if let Err(e) = self
            .ctx
            .mqtt
            .publish(topics.request.topic(), topics.request.qos(), topics.request.retain(), &message)
            .await
        {
            warn!(error = %e, "failed to publish action request");
            return NodeStatus::Failure;
        }

        self.set_status(NodeStatus::Running);
        NodeStatus::Running
    }

    async fn halt(&self) {
        let uuid = self.current_uuid.lock().expect("uuid mutex poisoned").clone();
        if let (Some(topics), Some(uuid)) = (self.topics.get().and_then(|t| t.as_ref()), uuid) {
            if let Some(halt_topic) = &topics.halt {
                let message = json!({ "Uuid": uuid });
                if let Err(e) = self
                    .ctx
                    .mqtt
                    .publish(halt_topic.topic(), halt_topic.qos(), halt_topic.retain(), &message)
                    .await
                {
                    warn!(error = %e, "failed to publish action halt");
                }
            }
        }
        self.set_status(NodeStatus::Idle);
        *self.current_uuid.lock().expect("uuid mutex poisoned") = None;
    }

    async fn prime(&self) {
        let _ = self.topics().await;
    }
}

impl<B: MessageBuilder + 'static> NodeSubscriber for StatefulMqttAction<B> {
    fn response_topics(&self) -> Vec<(String, String, u8)> {
        match self.topics.get().and_then(|t| t.as_ref()) {
            Some(topics) => vec![(
                "response".to_string(),
                topics.response.pattern().to_string(),
                topics.response.qos(),
            )],
            None => Vec::new(),
        }
    }

    fn process_message(&self, topic_key: &str, _topic: &str, payload: &Value, _props: &MessageProps) {
        if topic_key != "response" {
            return;
        }
        let Some(topics) = self.topics.get().and_then(|t| t.as_ref()) else {
            return;
        };
        if !topics.response.validate(payload) {
            debug!("action response failed schema validation, dropping");
            return;
        }

        let mut current_uuid = self.current_uuid.lock().expect("uuid mutex poisoned");
        let Some(expected) = current_uuid.as_deref() else {
            return;
        };
        if payload.get("Uuid").and_then(Value::as_str) != Some(expected) {
            return;
        }

        match payload.get("State").and_then(Value::as_str) {
            Some("SUCCESS") => {
                self.set_status(NodeStatus::Success);
                *current_uuid = None;
            }
            Some("FAILURE") => {
                self.set_status(NodeStatus::Failure);
                *current_uuid = None;
            }
            _ => {
                self.set_status(NodeStatus::Running);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_message_carries_only_uuid() {
        let builder = GenericMessage {
            interaction: "occupy".to_string(),
        };
        assert_eq!(builder.interaction(), "occupy");
    }

    #[test]
    fn refill_message_tracks_observed_weight() {
        let builder = RefillMessage::new("refill");
        assert_eq!(builder.current_weight(), None);
        builder.observe_weight(12.5);
        assert_eq!(builder.current_weight(), Some(12.5));
    }
}
