//! `Occupy` decorator (§4.5.4): request occupation from every candidate
//! asset at once and keep the first one that responds `SUCCESS`,
//! releasing every other responder.
//!
//! Grounded on `Occupy`
//! (`original_source/BT_Controller/include/bt/decorators/occupy.h` and its
//! `.cpp`): per-asset UUIDs are tracked in a map so a response can be
//! routed back to its asset; the first `SUCCESS` during `STARTING` wins
//! and becomes `{SelectedAsset}`/`{Uuid}`, every other pending or later
//! responder is queued for release. The child only ever sees the winner.

use crate::bt::nodes::context::NodeContext;
use crate::bt::tree::{Node, NodeStatus};
use crate::interface_cache::Direction;
use crate::mqtt::client::MessageProps;
use crate::mqtt::distributor::NodeSubscriber;
use crate::mqtt::topic::TopicDescriptor;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{info, warn};
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

struct AssetTopics {
    occupy_request: TopicDescriptor,
    release_request: TopicDescriptor,
    occupy_response: TopicDescriptor,
    release_response: TopicDescriptor,
}

#[derive(Default)]
struct OccupyState {
    selected_asset: Option<String>,
    asset_uuids: HashMap<String, String>,
    pending_assets: HashSet<String>,
    assets_to_release: HashSet<String>,
}

pub struct Occupy {
    ctx: Arc<NodeContext>,
    assets_port: String,
    child: Arc<dyn Node>,
    topics: OnceCell<HashMap<String, AssetTopics>>,
    phase: Mutex<Phase>,
    state: Mutex<OccupyState>,
}

impl Occupy {
    pub fn new(ctx: Arc<NodeContext>, assets_port: impl Into<String>, child: Arc<dyn Node>) -> Self {
        Self {
            ctx,
            assets_port: assets_port.into(),
            child,
            topics: OnceCell::new(),
            phase: Mutex::new(Phase::Idle),
            state: Mutex::new(OccupyState::default()),
        }
    }

    fn asset_ids(&self) -> Vec<String> {
        self.ctx
            .blackboard
            .get(&self.assets_port)
            .and_then(|v| v.as_array().cloned())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    async fn topics(&self) -> &HashMap<String, AssetTopics> {
        self.topics
            .get_or_init(|| async {
                let mut map = HashMap::new();
                for asset_id in self.asset_ids() {
                    let occupy_request = self.ctx.resolve_topic(&asset_id, "occupy", Direction::Input).await;
                    let release_request = self.ctx.resolve_topic(&asset_id, "release", Direction::Input).await;
                    let occupy_response = self.ctx.resolve_topic(&asset_id, "occupy", Direction::Output).await;
                    let release_response = self.ctx.resolve_topic(&asset_id, "release", Direction::Output).await;
                    match (occupy_request, release_request, occupy_response, release_response) {
                        (Some(oreq), Some(rreq), Some(oresp), Some(rresp)) => {
                            map.insert(
                                asset_id,
                                AssetTopics {
                                    occupy_request: oreq,
                                    release_request: rreq,
                                    occupy_response: oresp,
                                    release_response: rresp,
                                },
                            );
                        }
                        _ => warn!(%asset_id, "occupy could not resolve interfaces for candidate asset"),
                    }
                }
                map
            })
            .await
    }

    fn phase(&self) -> Phase {
        *self.phase.lock().expect("phase mutex poisoned")
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().expect("phase mutex poisoned") = phase;
    }

    async fn send_register_to_all(&self) {
        let topics = self.topics().await;
        let asset_ids: Vec<String> = topics.keys().cloned().collect();
        for asset_id in asset_ids {
            self.send_register(&asset_id).await;
        }
    }

    async fn send_register(&self, asset_id: &str) {
        let Some(topics) = self.topics.get().and_then(|m| m.get(asset_id)) else {
            return;
        };
        let uuid = Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock().expect("occupy state mutex poisoned");
            state.asset_uuids.insert(asset_id.to_string(), uuid.clone());
            state.pending_assets.insert(asset_id.to_string());
        }
        let message = json!({ "Uuid": uuid });
        if let Err(e) = self
            .ctx
            .mqtt
            .publish(
                topics.occupy_request.topic(),
                topics.occupy_request.qos(),
                topics.occupy_request.retain(),
                &message,
            )
            .await
        {
            warn!(error = %e, %asset_id, "failed to publish occupy request");
        }
    }

    async fn send_release(&self, asset_id: &str) {
        let uuid = {
            let state = self.state.lock().expect("occupy state mutex poisoned");
            state.asset_uuids.get(asset_id).cloned()
        };
        let Some(uuid) = uuid else {
            return;
        };
        let Some(topics) = self.topics.get().and_then(|m| m.get(asset_id)) else {
            return;
        };
        let message = json!({ "Uuid": uuid });
        if let Err(e) = self
            .ctx
            .mqtt
            .publish(
                topics.release_request.topic(),
                topics.release_request.qos(),
                topics.release_request.retain(),
                &message,
            )
            .await
        {
            warn!(error = %e, %asset_id, "failed to publish occupy release");
        }
    }
}

#[async_trait]
impl Node for Occupy {
    async fn tick(&self) -> NodeStatus {
        if self.asset_ids().is_empty() {
            return NodeStatus::Failure;
        }

        match self.phase() {
            Phase::Idle => {
                self.set_phase(Phase::Starting);
                *self.state.lock().expect("occupy state mutex poisoned") = OccupyState::default();
                self.send_register_to_all().await;
                NodeStatus::Running
            }
            Phase::Execute => match self.child.tick().await {
                NodeStatus::Failure => {
                    self.child.halt().await;
                    self.set_phase(Phase::Stopping);
                    let selected = self.state.lock().expect("occupy state mutex poisoned").selected_asset.clone();
                    if let Some(asset_id) = selected {
                        self.send_release(&asset_id).await;
                    }
                    NodeStatus::Running
                }
                NodeStatus::Success => {
                    self.child.halt().await;
                    self.set_phase(Phase::Completing);
                    let selected = self.state.lock().expect("occupy state mutex poisoned").selected_asset.clone();
                    if let Some(asset_id) = selected {
                        self.send_release(&asset_id).await;
                    }
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
        let (selected, pending): (Option<String>, Vec<String>) = {
            let state = self.state.lock().expect("occupy state mutex poisoned");
            (state.selected_asset.clone(), state.pending_assets.iter().cloned().collect())
        };
        if let Some(asset_id) = selected {
            self.send_release(&asset_id).await;
        }
        for asset_id in pending {
            self.send_release(&asset_id).await;
        }
        self.set_phase(Phase::Idle);
        self.child.halt().await;
    }

    async fn prime(&self) {
        let _ = self.topics().await;
        self.child.prime().await;
    }
}

impl NodeSubscriber for Occupy {
    fn response_topics(&self) -> Vec<(String, String, u8)> {
        let Some(topics) = self.topics.get() else {
            return Vec::new();
        };
        topics
            .iter()
            .flat_map(|(asset_id, t)| {
                [
                    (
                        format!("occupy_response::{asset_id}"),
                        t.occupy_response.pattern().to_string(),
                        t.occupy_response.qos(),
                    ),
                    (
                        format!("release_response::{asset_id}"),
                        t.release_response.pattern().to_string(),
                        t.release_response.qos(),
                    ),
                ]
            })
            .collect()
    }

    fn process_message(&self, topic_key: &str, _topic: &str, payload: &Value, _props: &MessageProps) {
        if self.phase() == Phase::Idle {
            return;
        }
        let Some((kind, asset_id)) = topic_key.split_once("::") else {
            return;
        };
        let received_uuid = payload.get("Uuid").and_then(Value::as_str);
        let state_field = payload.get("State").and_then(Value::as_str);
        let Some(received_uuid) = received_uuid else {
            return;
        };

        let mut state = self.state.lock().expect("occupy state mutex poisoned");
        if state.asset_uuids.get(asset_id).map(String::as_str) != Some(received_uuid) {
            return;
        }

        match kind {
            "occupy_response" => {
                if self.phase() != Phase::Starting {
                    return;
                }
                state.pending_assets.remove(asset_id);
                match state_field {
                    Some("SUCCESS") => {
                        if state.selected_asset.is_none() {
                            state.selected_asset = Some(asset_id.to_string());
                            self.ctx.blackboard.set("SelectedAsset", asset_id.to_string());
                            if let Some(uuid) = state.asset_uuids.get(asset_id).cloned() {
                                self.ctx.blackboard.set("Uuid", uuid);
                            }
                            let remaining: Vec<String> = state.pending_assets.iter().cloned().collect();
                            state.assets_to_release.extend(remaining);
                            info!(%asset_id, "asset selected for occupation");
                            drop(state);
                            self.set_phase(Phase::Execute);
                        } else {
                            info!(%asset_id, selected = %state.selected_asset.as_deref().unwrap_or(""), "asset succeeded after selection, releasing");
                            let release_uuid = state.asset_uuids.get(asset_id).cloned();
                            let release_topic = self.topics.get().and_then(|m| m.get(asset_id)).map(|t| t.release_request.clone());
                            drop(state);
                            if let (Some(uuid), Some(topic)) = (release_uuid, release_topic) {
                                let mqtt = self.ctx.mqtt.clone();
                                tokio::spawn(async move {
                                    let message = json!({ "Uuid": uuid });
                                    if let Err(e) = mqtt.publish(topic.topic(), topic.qos(), topic.retain(), &message).await {
                                        warn!(error = %e, "failed to release redundant occupy responder");
                                    }
                                });
                            }
                        }
                    }
                    Some("FAILURE") => {
                        let all_failed = state.pending_assets.is_empty() && state.selected_asset.is_none();
                        drop(state);
                        if all_failed {
                            self.set_phase(Phase::Stopped);
                        }
                    }
                    _ => {}
                }
            }
            "release_response" => {
                state.assets_to_release.remove(asset_id);
                let is_selected = state.selected_asset.as_deref() == Some(asset_id);
                let phase = self.phase();
                drop(state);
                if is_selected {
                    match state_field {
                        Some("SUCCESS") if phase == Phase::Completing => self.set_phase(Phase::Complete),
                        Some("SUCCESS") if phase == Phase::Stopping => self.set_phase(Phase::Stopped),
                        Some("FAILURE") => self.set_phase(Phase::Stopped),
                        _ => {}
                    }
                }
            }
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

    struct AlwaysRunning;

    #[async_trait]
    impl Node for AlwaysRunning {
        async fn tick(&self) -> NodeStatus {
            NodeStatus::Running
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

    fn topics_for(asset_id: &str) -> AssetTopics {
        AssetTopics {
            occupy_request: TopicDescriptor::new(format!("uns/{asset_id}/CMD/Occupy"), 2, false),
            release_request: TopicDescriptor::new(format!("uns/{asset_id}/CMD/Release"), 2, false),
            occupy_response: TopicDescriptor::new(format!("uns/{asset_id}/DATA/Occupy"), 2, false),
            release_response: TopicDescriptor::new(format!("uns/{asset_id}/DATA/Release"), 2, false),
        }
    }

    /// Builds an `Occupy` over `assets`, pre-seeds its resolved topics
    /// (bypassing AAS resolution) and sends it through a fresh `STARTING`
    /// tick so every asset has a pending registration and a tracked UUID.
    async fn starting_occupy(assets: &[&str]) -> Arc<Occupy> {
        let ctx = test_ctx();
        ctx.blackboard.set(
            "Assets",
            Value::Array(assets.iter().map(|a| Value::String(a.to_string())).collect()),
        );
        let occupy = Arc::new(Occupy::new(ctx, "Assets", Arc::new(AlwaysRunning)));
        let mut map = HashMap::new();
        for asset_id in assets {
            map.insert(asset_id.to_string(), topics_for(asset_id));
        }
        let _ = occupy.topics.set(map);
        assert_eq!(occupy.tick().await, NodeStatus::Running);
        occupy
    }

    fn uuid_for(occupy: &Occupy, asset_id: &str) -> String {
        occupy
            .state
            .lock()
            .unwrap()
            .asset_uuids
            .get(asset_id)
            .cloned()
            .expect("asset was registered during STARTING")
    }

    #[tokio::test]
    async fn empty_asset_list_fails_immediately() {
        let ctx = test_ctx();
        ctx.blackboard.set("Assets", Value::Array(vec![]));
        let occupy = Occupy::new(ctx, "Assets", Arc::new(AlwaysRunning));
        assert_eq!(occupy.tick().await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn first_success_wins_and_losers_are_released() {
        let occupy = starting_occupy(&["a", "b", "c"]).await;

        let uuid_b = uuid_for(&occupy, "b");
        occupy.process_message(
            "occupy_response::b",
            "uns/b/DATA/Occupy",
            &json!({"Uuid": uuid_b, "State": "SUCCESS"}),
            &MessageProps::default(),
        );

        assert_eq!(occupy.phase(), Phase::Execute);
        assert_eq!(occupy.ctx.blackboard.get_str("SelectedAsset").as_deref(), Some("b"));
        let state = occupy.state.lock().unwrap();
        assert!(state.assets_to_release.contains("a"));
        assert!(state.assets_to_release.contains("c"));
        assert!(!state.assets_to_release.contains("b"));
    }

    #[tokio::test]
    async fn later_success_after_selection_is_released_not_adopted() {
        let occupy = starting_occupy(&["a", "b"]).await;

        let uuid_b = uuid_for(&occupy, "b");
        occupy.process_message(
            "occupy_response::b",
            "uns/b/DATA/Occupy",
            &json!({"Uuid": uuid_b, "State": "SUCCESS"}),
            &MessageProps::default(),
        );
        assert_eq!(occupy.ctx.blackboard.get_str("SelectedAsset").as_deref(), Some("b"));

        let uuid_a = uuid_for(&occupy, "a");
        occupy.process_message(
            "occupy_response::a",
            "uns/a/DATA/Occupy",
            &json!({"Uuid": uuid_a, "State": "SUCCESS"}),
            &MessageProps::default(),
        );

        // the late winner never overwrites the already-selected asset
        assert_eq!(occupy.ctx.blackboard.get_str("SelectedAsset").as_deref(), Some("b"));
        assert_eq!(occupy.phase(), Phase::Execute);
    }

    #[tokio::test]
    async fn response_with_unknown_uuid_is_ignored() {
        let occupy = starting_occupy(&["a"]).await;
        occupy.process_message(
            "occupy_response::a",
            "uns/a/DATA/Occupy",
            &json!({"Uuid": "not-the-tracked-uuid", "State": "SUCCESS"}),
            &MessageProps::default(),
        );
        assert_eq!(occupy.phase(), Phase::Starting);
        assert_eq!(occupy.ctx.blackboard.get_str("SelectedAsset"), None);
    }

    #[tokio::test]
    async fn all_candidates_failing_stops_the_decorator() {
        let occupy = starting_occupy(&["a", "b"]).await;

        let uuid_a = uuid_for(&occupy, "a");
        occupy.process_message(
            "occupy_response::a",
            "uns/a/DATA/Occupy",
            &json!({"Uuid": uuid_a, "State": "FAILURE"}),
            &MessageProps::default(),
        );
        assert_eq!(occupy.phase(), Phase::Starting);

        let uuid_b = uuid_for(&occupy, "b");
        occupy.process_message(
            "occupy_response::b",
            "uns/b/DATA/Occupy",
            &json!({"Uuid": uuid_b, "State": "FAILURE"}),
            &MessageProps::default(),
        );
        assert_eq!(occupy.phase(), Phase::Stopped);
        assert_eq!(occupy.tick().await, NodeStatus::Failure);
        assert_eq!(occupy.phase(), Phase::Idle);
    }
}
