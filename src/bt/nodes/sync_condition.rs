//! Sync MQTT condition node (§4.5.2).
//!
//! Grounded on `MqttSyncConditionNode`
//! (`original_source/BT_Controller/include/bt/mqtt_sync_condition_node.h`
//! and its `.cpp`): `callback` just stores the latest payload under its
//! mutex; `tick()` is the side-effect-free comparison against the field
//! named by `Field`. The `equal("operational", "State")` pseudo-operator
//! (any state in the "running" PackML cluster) is `ComparisonType::Operational`
//! here rather than a magic string pair.

use crate::bt::nodes::context::NodeContext;
use crate::bt::tree::{Node, NodeStatus};
use crate::interface_cache::Direction;
use crate::mqtt::client::MessageProps;
use crate::mqtt::distributor::NodeSubscriber;
use crate::mqtt::topic::TopicDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonType {
    Equal,
    NotEqual,
    Greater,
    Less,
    Contains,
    Inside,
    Outside,
    /// The `equal("operational", Field)` pseudo-operator: matches any
    /// PackML state in `{IDLE, STARTING, EXECUTE, COMPLETING, COMPLETE,
    /// RESETTING}`.
    Operational,
}

const OPERATIONAL_STATES: &[&str] = &[
    "IDLE",
    "STARTING",
    "EXECUTE",
    "COMPLETING",
    "COMPLETE",
    "RESETTING",
];

pub struct SyncMqttCondition {
    ctx: Arc<NodeContext>,
    asset_port: String,
    interaction: String,
    field: String,
    comparison: ComparisonType,
    expected: String,
    topic: OnceCell<Option<TopicDescriptor>>,
    latest: Mutex<Option<Value>>,
}

impl SyncMqttCondition {
    pub fn new(
        ctx: Arc<NodeContext>,
        asset_port: impl Into<String>,
        interaction: impl Into<String>,
        field: impl Into<String>,
        comparison: ComparisonType,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            asset_port: asset_port.into(),
            interaction: interaction.into(),
            field: field.into(),
            comparison,
            expected: expected.into(),
            topic: OnceCell::new(),
            latest: Mutex::new(None),
        }
    }

    async fn topic(&self) -> Option<&TopicDescriptor> {
        self.topic
            .get_or_init(|| async {
                let asset_id = self.ctx.blackboard.get_str(&self.asset_port)?;
                self.ctx
                    .resolve_topic(&asset_id, &self.interaction, Direction::Output)
                    .await
            })
            .await
            .as_ref()
    }

    fn evaluate(&self, payload: &Value) -> NodeStatus {
        evaluate_condition(&self.field, self.comparison, &self.expected, payload)
    }
}

/// Pure comparison logic, factored out of [`SyncMqttCondition`] so it can be
/// exercised without a live [`NodeContext`].
fn evaluate_condition(
    field: &str,
    comparison: ComparisonType,
    expected: &str,
    payload: &Value,
) -> NodeStatus {
    let Some(field_value) = payload.get(field) else {
        return NodeStatus::Failure;
    };

    let matched = match comparison {
        ComparisonType::Operational => field_value
            .as_str()
            .map(|s| OPERATIONAL_STATES.contains(&s))
            .unwrap_or(false),
        ComparisonType::Equal => value_as_comparable(field_value) == expected,
        ComparisonType::NotEqual => value_as_comparable(field_value) != expected,
        ComparisonType::Contains => field_value
            .as_str()
            .map(|s| s.contains(expected))
            .unwrap_or(false),
        ComparisonType::Greater | ComparisonType::Less => {
            let (Some(actual), Ok(expected)) = (field_value.as_f64(), expected.parse::<f64>())
            else {
                return NodeStatus::Failure;
            };
            if comparison == ComparisonType::Greater {
                actual > expected
            } else {
                actual < expected
            }
        }
        ComparisonType::Inside | ComparisonType::Outside => {
            let Some(actual) = field_value.as_f64() else {
                return NodeStatus::Failure;
            };
            let Some((min, max)) = parse_range(expected) else {
                return NodeStatus::Failure;
            };
            let within = actual >= min && actual <= max;
            if comparison == ComparisonType::Inside {
                within
            } else {
                !within
            }
        }
    };

    if matched {
        NodeStatus::Success
    } else {
        NodeStatus::Failure
    }
}

fn value_as_comparable(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_range(expected: &str) -> Option<(f64, f64)> {
    let (min_str, max_str) = expected.split_once(';')?;
    Some((min_str.trim().parse().ok()?, max_str.trim().parse().ok()?))
}

#[async_trait]
impl Node for SyncMqttCondition {
    async fn tick(&self) -> NodeStatus {
        let _ = self.topic().await;
        let Some(payload) = self.latest.lock().expect("latest mutex poisoned").clone() else {
            return NodeStatus::Failure;
        };
        self.evaluate(&payload)
    }

    async fn prime(&self) {
        let _ = self.topic().await;
    }
}

impl NodeSubscriber for SyncMqttCondition {
    fn response_topics(&self) -> Vec<(String, String, u8)> {
        match self.topic.get().and_then(|t| t.as_ref()) {
            Some(topic) => vec![("response".to_string(), topic.pattern().to_string(), topic.qos())],
            None => Vec::new(),
        }
    }

    fn process_message(&self, topic_key: &str, _topic: &str, payload: &Value, _props: &MessageProps) {
        if topic_key != "response" {
            return;
        }
        if let Some(topic) = self.topic.get().and_then(|t| t.as_ref()) {
            if !topic.validate(payload) {
                debug!("sync condition payload failed schema validation, dropping");
                return;
            }
        }
        *self.latest.lock().expect("latest mutex poisoned") = Some(payload.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_field_is_failure() {
        let status = evaluate_condition("State", ComparisonType::Equal, "operational", &json!({"Other": 1}));
        assert_eq!(status, NodeStatus::Failure);
    }

    #[test]
    fn operational_matches_running_cluster() {
        let status = evaluate_condition(
            "State",
            ComparisonType::Operational,
            "",
            &json!({"State": "EXECUTE"}),
        );
        assert_eq!(status, NodeStatus::Success);
        let status = evaluate_condition(
            "State",
            ComparisonType::Operational,
            "",
            &json!({"State": "ABORTED"}),
        );
        assert_eq!(status, NodeStatus::Failure);
    }

    #[test]
    fn inside_range_parses_min_max() {
        let status = evaluate_condition("State", ComparisonType::Inside, "1;10", &json!({"State": 5}));
        assert_eq!(status, NodeStatus::Success);
        let status = evaluate_condition("State", ComparisonType::Inside, "1;10", &json!({"State": 15}));
        assert_eq!(status, NodeStatus::Failure);
    }

    #[test]
    fn outside_range_is_negation_of_inside() {
        let status = evaluate_condition("State", ComparisonType::Outside, "1;10", &json!({"State": 15}));
        assert_eq!(status, NodeStatus::Success);
        let status = evaluate_condition("State", ComparisonType::Outside, "1;10", &json!({"State": 5}));
        assert_eq!(status, NodeStatus::Failure);
    }
}
