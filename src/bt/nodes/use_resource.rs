//! `UseResource` decorator (§4.5.3): register with a station for the
//! duration of a single child tick, unregistering whether the child
//! succeeds or fails.
//!
//! Grounded on `UseResource`
//! (`original_source/BT_Controller/include/bt/decorators/use_resource.h`):
//! `tick()` is a small phase machine (`STARTING` -> register ->
//! `EXECUTE` -> tick child -> `COMPLETING`/`STOPPING` -> unregister ->
//! `COMPLETE`/`STOPPED` -> forward the terminal status upward on the next
//! tick), driven by `register_response`/`unregister_response` messages
//! rather than by the child's own status.

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
use tracing::warn;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Execute,
    Completing,
    Complete,
    Stopping,
    Stopped,
}

struct UseResourceTopics {
    register: TopicDescriptor,
    unregister: TopicDescriptor,
    register_response: TopicDescriptor,
    unregister_response: TopicDescriptor,
}

pub struct UseResource {
    ctx: Arc<NodeContext>,
    asset_port: String,
    context: Option<i64>,
    child: Arc<dyn Node>,
    topics: OnceCell<Option<UseResourceTopics>>,
    phase: Mutex<Phase>,
    current_uuid: Mutex<Option<String>>,
}

impl UseResource {
    pub fn new(
        ctx: Arc<NodeContext>,
        asset_port: impl Into<String>,
        context: Option<i64>,
        child: Arc<dyn Node>,
    ) -> Self {
        Self {
            ctx,
            asset_port: asset_port.into(),
            context,
            child,
            topics: OnceCell::new(),
            phase: Mutex::new(Phase::Idle),
            current_uuid: Mutex::new(None),
        }
    }

    fn asset_id(&self) -> Option<String> {
        self.ctx.blackboard.get_str(&self.asset_port)
    }

    async fn topics(&self) -> Option<&UseResourceTopics> {
        self.topics
            .get_or_init(|| async {
                let asset_id = self.asset_id()?;
                let register = self.ctx.resolve_topic(&asset_id, "register", Direction::Input).await?;
                let unregister = self
                    .ctx
                    .resolve_topic(&asset_id, "unregister", Direction::Input)
                    .await?;
                let register_response = self
                    .ctx
                    .resolve_topic(&asset_id, "register", Direction::Output)
                    .await?;
                let unregister_response = self
                    .ctx
                    .resolve_topic(&asset_id, "unregister", Direction::Output)
                    .await?;
                Some(UseResourceTopics {
                    register,
                    unregister,
                    register_response,
                    unregister_response,
                })
            })
            .await
            .as_ref()
    }

    fn phase(&self) -> Phase {
        *self.phase.lock().expect("phase mutex poisoned")
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().expect("phase mutex poisoned") = phase;
    }

    async fn send_register(&self) {
        let Some(topics) = self.topics().await else {
            warn!(port = %self.asset_port, "use_resource could not resolve topics from AAS");
            return;
        };
        let uuid = self
            .ctx
            .blackboard
            .get_str("Uuid")
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        *self.current_uuid.lock().expect("uuid mutex poisoned") = Some(uuid.clone());
        self.ctx.blackboard.set("Uuid", uuid.clone());

        let mut message = json!({ "Uuid": uuid });
        if let Some(context) = self.context.filter(|c| *c >= 0) {
            message["Context"] = json!(context);
        }
        if let Err(e) = self
            .ctx
            .mqtt
            .publish(topics.register.topic(), topics.register.qos(), topics.register.retain(), &message)
            .await
        {
            warn!(error = %e, "failed to publish use_resource register");
        }
    }

    async fn send_unregister(&self) {
        let Some(topics) = self.topics.get().and_then(|t| t.as_ref()) else {
            return;
        };
        let uuid = self.current_uuid.lock().expect("uuid mutex poisoned").clone();
        let Some(uuid) = uuid else { return };
        let message = json!({ "Uuid": uuid });
        if let Err(e) = self
            .ctx
            .mqtt
            .publish(topics.unregister.topic(), topics.unregister.qos(), topics.unregister.retain(), &message)
            .await
        {
            warn!(error = %e, "failed to publish use_resource unregister");
        }
    }
}

#[async_trait]
impl Node for UseResource {
    async fn tick(&self) -> NodeStatus {
        match self.phase() {
            Phase::Idle => {
                self.set_phase(Phase::Starting);
                self.send_register().await;
                NodeStatus::Running
            }
            Phase::Execute => match self.child.tick().await {
                NodeStatus::Failure => {
                    self.child.halt().await;
                    self.set_phase(Phase::Stopping);
                    self.send_unregister().await;
                    NodeStatus::Running
                }
                NodeStatus::Success => {
                    self.child.halt().await;
                    self.set_phase(Phase::Completing);
                    self.send_unregister().await;
                    NodeStatus::Running
                }
                _ => NodeStatus::Running,
            },
            Phase::Stopped => {
                self.set_phase(Phase::Idle);
                NodeStatus::Failure
            }
            Phase::Complete => {
                self.set_phase(Phase::Idle);
                NodeStatus::Success
            }
            Phase::Starting | Phase::Completing | Phase::Stopping => NodeStatus::Running,
        }
    }

    async fn halt(&self) {
        self.send_unregister().await;
        self.set_phase(Phase::Idle);
        *self.current_uuid.lock().expect("uuid mutex poisoned") = None;
        self.child.halt().await;
    }

    async fn prime(&self) {
        let _ = self.topics().await;
        self.child.prime().await;
    }
}

impl NodeSubscriber for UseResource {
    fn response_topics(&self) -> Vec<(String, String, u8)> {
        match self.topics.get().and_then(|t| t.as_ref()) {
            Some(topics) => vec![
                (
                    "register_response".to_string(),
                    topics.register_response.pattern().to_string(),
                    topics.register_response.qos(),
                ),
                (
                    "unregister_response".to_string(),
                    topics.unregister_response.pattern().to_string(),
                    topics.unregister_response.qos(),
                ),
            ],
            None => Vec::new(),
        }
    }

    fn process_message(&self, topic_key: &str, _topic: &str, payload: &Value, _props: &MessageProps) {
        if self.phase() == Phase::Idle {
            return;
        }
        let current_uuid = self.current_uuid.lock().expect("uuid mutex poisoned").clone();
        let Some(expected) = current_uuid else { return };
        if payload.get("Uuid").and_then(Value::as_str) != Some(expected.as_str()) {
            return;
        }
        let state = payload.get("State").and_then(Value::as_str);

        match topic_key {
            "register_response" => match state {
                Some("SUCCESS") => self.set_phase(Phase::Execute),
                Some("FAILURE") => self.set_phase(Phase::Stopped),
                _ => {}
            },
            "unregister_response" => match (self.phase(), state) {
                (Phase::Completing, Some("SUCCESS")) => self.set_phase(Phase::Complete),
                // any terminal reply while STOPPING moves on; the node must
                // not wedge in STOPPING just because a reply omits State.
                (Phase::Stopping, _) => self.set_phase(Phase::Stopped),
                (_, Some("FAILURE")) => self.set_phase(Phase::Stopped),
                _ => {}
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aas::client::AasClient;
    use crate::bt::blackboard::Blackboard;
    use crate::bt::tree::Node;
    use crate::interface_cache::InterfaceCache;
    use crate::mqtt::client::MqttClient;
    use crate::mqtt::distributor::MessageDistributor;

    struct Fixed(NodeStatus);

    #[async_trait]
    impl Node for Fixed {
        async fn tick(&self) -> NodeStatus {
            self.0
        }
    }

    fn test_ctx() -> Arc<NodeContext> {
        let aas_client = Arc::new(AasClient::new("http://repo.invalid", "http://registry.invalid"));
        Arc::new(NodeContext {
            blackboard: Arc::new(Blackboard::new()),
            mqtt: MqttClient::for_test(),
            distributor: Arc::new(MessageDistributor::new()),
            interface_cache: Arc::new(InterfaceCache::new(aas_client.clone())),
            aas_provider: Arc::new(crate::aas::provider::AasClientProvider::new(aas_client.clone())),
            aas_client,
        })
    }

    fn stub_topics() -> UseResourceTopics {
        UseResourceTopics {
            register: TopicDescriptor::new("uns/press-1/CMD/Register", 2, false),
            unregister: TopicDescriptor::new("uns/press-1/CMD/Unregister", 2, false),
            register_response: TopicDescriptor::new("uns/press-1/DATA/Register", 2, false),
            unregister_response: TopicDescriptor::new("uns/press-1/DATA/Unregister", 2, false),
        }
    }

    fn use_resource_with(child: Arc<dyn Node>) -> Arc<UseResource> {
        let ctx = test_ctx();
        ctx.blackboard.set("Asset", "press-1".to_string());
        let node = Arc::new(UseResource::new(ctx, "Asset", None, child));
        let _ = node.topics.set(Some(stub_topics()));
        node
    }

    fn current_uuid(node: &UseResource) -> String {
        node.current_uuid
            .lock()
            .unwrap()
            .clone()
            .expect("register was sent")
    }

    #[tokio::test]
    async fn child_success_flows_through_unregister_to_success() {
        let node = use_resource_with(Arc::new(Fixed(NodeStatus::Success)));

        assert_eq!(node.tick().await, NodeStatus::Running); // STARTING: register sent
        let uuid = current_uuid(&node);
        node.process_message(
            "register_response",
            "uns/press-1/DATA/Register",
            &json!({"Uuid": uuid, "State": "SUCCESS"}),
            &MessageProps::default(),
        );
        assert_eq!(node.phase(), Phase::Execute);

        assert_eq!(node.tick().await, NodeStatus::Running); // ticks child, child succeeds, unregisters
        assert_eq!(node.phase(), Phase::Completing);

        node.process_message(
            "unregister_response",
            "uns/press-1/DATA/Unregister",
            &json!({"Uuid": uuid, "State": "SUCCESS"}),
            &MessageProps::default(),
        );
        assert_eq!(node.phase(), Phase::Complete);
        assert_eq!(node.tick().await, NodeStatus::Success);
        assert_eq!(node.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn child_failure_still_unregisters_and_reports_failure() {
        let node = use_resource_with(Arc::new(Fixed(NodeStatus::Failure)));

        node.tick().await;
        let uuid = current_uuid(&node);
        node.process_message(
            "register_response",
            "uns/press-1/DATA/Register",
            &json!({"Uuid": uuid, "State": "SUCCESS"}),
            &MessageProps::default(),
        );

        node.tick().await;
        assert_eq!(node.phase(), Phase::Stopping);

        node.process_message(
            "unregister_response",
            "uns/press-1/DATA/Unregister",
            &json!({"Uuid": uuid, "State": "SUCCESS"}),
            &MessageProps::default(),
        );
        assert_eq!(node.phase(), Phase::Stopped);
        assert_eq!(node.tick().await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn register_failure_stops_without_ticking_child() {
        let node = use_resource_with(Arc::new(Fixed(NodeStatus::Success)));
        node.tick().await;
        let uuid = current_uuid(&node);
        node.process_message(
            "register_response",
            "uns/press-1/DATA/Register",
            &json!({"Uuid": uuid, "State": "FAILURE"}),
            &MessageProps::default(),
        );
        assert_eq!(node.phase(), Phase::Stopped);
        assert_eq!(node.tick().await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn response_for_a_stale_uuid_is_ignored() {
        let node = use_resource_with(Arc::new(Fixed(NodeStatus::Success)));
        node.tick().await;
        node.process_message(
            "register_response",
            "uns/press-1/DATA/Register",
            &json!({"Uuid": "some-other-run's-uuid", "State": "SUCCESS"}),
            &MessageProps::default(),
        );
        assert_eq!(node.phase(), Phase::Starting);
    }

    #[tokio::test]
    async fn halt_publishes_unregister_and_resets_to_idle() {
        let node = use_resource_with(Arc::new(Fixed(NodeStatus::Success)));
        node.tick().await;
        let uuid = current_uuid(&node);
        node.process_message(
            "register_response",
            "uns/press-1/DATA/Register",
            &json!({"Uuid": uuid, "State": "SUCCESS"}),
            &MessageProps::default(),
        );
        node.halt().await;
        assert_eq!(node.phase(), Phase::Idle);
        assert!(node.current_uuid.lock().unwrap().is_none());
    }
}
