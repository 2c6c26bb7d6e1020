//! The orchestrator's own PackML state engine (§4.1): receives external
//! Start/Stop/Suspend/Unsuspend/Reset commands, runs the `STARTING`
//! discovery procedure, and drives the armed tree's tick loop.
//!
//! Grounded on `BehaviorTreeController` in
//! `original_source/BT_Controller/include/BehaviorTreeController.h` and
//! `src/BehaviorTreeController.cpp`: a single control loop owns the tree,
//! the distributor, the AAS client, and the interface cache; MQTT command
//! callbacks only record intent (mirrors `mqtt_start_bt_flag_` et al.),
//! leaving the actual state transition and any blocking AAS/HTTP work to
//! the control loop, never the delivery task.

use crate::aas::client::AasClient;
use crate::aas::provider::{AasClientProvider, CachingAasProvider};
use crate::bt::blackboard::Blackboard;
use crate::bt::nodes::context::NodeContext;
use crate::bt::tree::{NodeStatus, Tree};
use crate::bt::xml;
use crate::config::OrchestratorConfig;
use crate::error::{AasError, ControllerError};
use crate::interface_cache::InterfaceCache;
use crate::mqtt::client::MqttClient;
use crate::mqtt::distributor::MessageDistributor;
use crate::packml::state::PackMlState;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const COMMAND_VERBS: [&str; 5] = ["Start", "Stop", "Suspend", "Unsuspend", "Reset"];
const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct PendingCommands {
    start: Option<(String, String)>,
    stop: Option<String>,
    suspend: Option<String>,
    unsuspend: Option<String>,
    reset: Option<String>,
}

/// Whether `command` may be accepted while the controller is in `state`,
/// per the gating table in §4.1. A pure function so the gating predicate
/// itself is testable without any MQTT or AAS plumbing.
fn command_allowed(state: PackMlState, command: &str) -> bool {
    match command {
        "Start" => state == PackMlState::Idle,
        "Stop" => true,
        "Suspend" => state == PackMlState::Execute,
        "Unsuspend" => state == PackMlState::Suspended,
        "Reset" => matches!(
            state,
            PackMlState::Stopped | PackMlState::Complete | PackMlState::Aborted
        ),
        _ => false,
    }
}

pub struct Controller {
    config: OrchestratorConfig,
    mqtt: MqttClient,
    distributor: Arc<MessageDistributor>,
    aas_client: Arc<AasClient>,
    interface_cache: Arc<InterfaceCache>,
    state: Mutex<PackMlState>,
    process_aas_id: Mutex<Option<String>>,
    tree: Mutex<Option<Arc<Tree>>>,
    blackboard: Mutex<Option<Arc<Blackboard>>>,
    pending: Mutex<PendingCommands>,
    shutdown: AtomicBool,
}

impl Controller {
    pub fn new(
        config: OrchestratorConfig,
        mqtt: MqttClient,
        distributor: Arc<MessageDistributor>,
        aas_client: Arc<AasClient>,
        interface_cache: Arc<InterfaceCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            mqtt,
            distributor,
            aas_client,
            interface_cache,
            state: Mutex::new(PackMlState::Idle),
            process_aas_id: Mutex::new(None),
            tree: Mutex::new(None),
            blackboard: Mutex::new(None),
            pending: Mutex::new(PendingCommands::default()),
            shutdown: AtomicBool::new(false),
        })
    }

    fn base_topic(&self) -> String {
        format!("{}/{}", self.config.mqtt.uns_topic, self.config.mqtt.client_id)
    }

    /// Subscribe to the five command topics and register always-live
    /// callbacks on the distributor (see DESIGN.md: these must survive
    /// `RESETTING`'s teardown of the per-tree subscriptions).
    pub async fn arm_command_channel(self: &Arc<Self>) -> Result<(), ControllerError> {
        let base = self.base_topic();
        for verb in COMMAND_VERBS {
            let topic = format!("{base}/CMD/{verb}");
            self.mqtt.subscribe(&topic, 2).await?;
            let this = Arc::clone(self);
            let verb_owned = verb.to_string();
            self.distributor.register_control(
                topic,
                Arc::new(move |payload: &Value| this.record_command(&verb_owned, payload)),
            );
        }
        Ok(())
    }

    fn record_command(&self, verb: &str, payload: &Value) {
        let Some(uuid) = payload.get("Uuid").and_then(Value::as_str).map(str::to_string) else {
            warn!(verb, "command message missing Uuid, dropping");
            return;
        };
        if verb == "Start" {
            let Some(process) = payload.get("Process").and_then(Value::as_str).map(str::to_string) else {
                warn!("Start command missing Process, dropping");
                return;
            };
            self.pending.lock().expect("pending mutex poisoned").start = Some((uuid, process));
            return;
        }
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        match verb {
            "Stop" => pending.stop = Some(uuid),
            "Suspend" => pending.suspend = Some(uuid),
            "Unsuspend" => pending.unsuspend = Some(uuid),
            "Reset" => pending.reset = Some(uuid),
            _ => unreachable!("only COMMAND_VERBS are registered"),
        }
    }

    fn current_state(&self) -> PackMlState {
        *self.state.lock().expect("state mutex poisoned")
    }

    /// Update state and publish `DATA/State`, but only on an actual change
    /// — the controller must never publish two consecutive identical
    /// states (§8's invariant).
    async fn set_state(&self, new_state: PackMlState) {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        info!(state = new_state.as_str(), "controller state changed");
        let topic = format!("{}/DATA/State", self.base_topic());
        let payload = serde_json::json!({
            "State": new_state.as_str(),
            "TimeStamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.mqtt.publish(&topic, 2, true, &payload).await {
            warn!(error = %e, "failed to publish controller state");
        }
    }

    async fn publish_command_response(&self, verb: &str, uuid: &str, success: bool) {
        let topic = format!("{}/DATA/{}", self.base_topic(), verb);
        let payload = serde_json::json!({
            "Uuid": uuid,
            "State": if success { "SUCCESS" } else { "FAILURE" },
            "TimeStamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.mqtt.publish(&topic, 2, false, &payload).await {
            warn!(error = %e, verb, "failed to publish command response");
        }
    }

    /// Runs the tick loop until `request_shutdown` is called. Never
    /// returns an error: every failure mode surfaces as a state
    /// transition and a command response, per §7.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.shutdown_cleanly().await;
                break;
            }
            self.drain_pending_commands().await;
            if self.current_state() == PackMlState::Execute {
                self.tick_tree().await;
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    async fn shutdown_cleanly(&self) {
        if self.current_state().is_armed() {
            if let Some(tree) = self.tree.lock().expect("tree mutex poisoned").take() {
                tree.halt().await;
            }
            self.set_state(PackMlState::Stopped).await;
        }
    }

    async fn drain_pending_commands(self: &Arc<Self>) {
        let (start, stop, suspend, unsuspend, reset) = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            (
                pending.start.take(),
                pending.stop.take(),
                pending.suspend.take(),
                pending.unsuspend.take(),
                pending.reset.take(),
            )
        };
        if let Some((uuid, process)) = start {
            self.handle_start(uuid, process).await;
        }
        if let Some(uuid) = stop {
            self.handle_stop(uuid).await;
        }
        if let Some(uuid) = suspend {
            self.handle_suspend(uuid).await;
        }
        if let Some(uuid) = unsuspend {
            self.handle_unsuspend(uuid).await;
        }
        if let Some(uuid) = reset {
            self.handle_reset(uuid).await;
        }
    }

    async fn handle_start(self: &Arc<Self>, uuid: String, process_id: String) {
        if !command_allowed(self.current_state(), "Start") {
            self.publish_command_response("Start", &uuid, false).await;
            return;
        }
        self.set_state(PackMlState::Starting).await;
        match self.run_starting_procedure(&process_id).await {
            Ok(tree) => {
                *self.tree.lock().expect("tree mutex poisoned") = Some(tree);
                *self.process_aas_id.lock().expect("process_aas_id mutex poisoned") = Some(process_id);
                self.set_state(PackMlState::Execute).await;
                self.publish_command_response("Start", &uuid, true).await;
            }
            Err(e) => {
                warn!(error = %e, process_id, "STARTING procedure failed");
                self.set_state(PackMlState::Aborted).await;
                self.publish_command_response("Start", &uuid, false).await;
            }
        }
    }

    async fn handle_stop(&self, uuid: String) {
        if self.current_state().is_armed() {
            self.set_state(PackMlState::Stopping).await;
            if let Some(tree) = self.tree.lock().expect("tree mutex poisoned").take() {
                tree.halt().await;
            }
            self.set_state(PackMlState::Stopped).await;
        }
        self.publish_command_response("Stop", &uuid, true).await;
    }

    async fn handle_suspend(&self, uuid: String) {
        if !command_allowed(self.current_state(), "Suspend") {
            self.publish_command_response("Suspend", &uuid, false).await;
            return;
        }
        self.set_state(PackMlState::Suspending).await;
        if let Some(tree) = self.tree.lock().expect("tree mutex poisoned").clone() {
            tree.halt().await;
        }
        self.set_state(PackMlState::Suspended).await;
        self.publish_command_response("Suspend", &uuid, true).await;
    }

    async fn handle_unsuspend(&self, uuid: String) {
        if !command_allowed(self.current_state(), "Unsuspend") {
            self.publish_command_response("Unsuspend", &uuid, false).await;
            return;
        }
        self.set_state(PackMlState::Execute).await;
        self.publish_command_response("Unsuspend", &uuid, true).await;
    }

    async fn handle_reset(&self, uuid: String) {
        if !command_allowed(self.current_state(), "Reset") {
            self.publish_command_response("Reset", &uuid, false).await;
            return;
        }
        self.set_state(PackMlState::Resetting).await;
        if let Some(tree) = self.tree.lock().expect("tree mutex poisoned").take() {
            tree.halt().await;
        }
        if let Err(e) = self.distributor.unsubscribe_all(&self.mqtt).await {
            warn!(error = %e, "failed to unsubscribe active tree topics during RESETTING");
        }
        *self.blackboard.lock().expect("blackboard mutex poisoned") = None;
        *self.process_aas_id.lock().expect("process_aas_id mutex poisoned") = None;
        self.set_state(PackMlState::Idle).await;
        self.publish_command_response("Reset", &uuid, true).await;
    }

    async fn tick_tree(self: &Arc<Self>) {
        let Some(tree) = self.tree.lock().expect("tree mutex poisoned").clone() else {
            return;
        };
        if let NodeStatus::Success | NodeStatus::Failure = tree.tick_once().await {
            self.set_state(PackMlState::Complete).await;
        }
    }

    /// §4.1 steps 1-6: build the equipment map, pre-fetch every asset's
    /// interfaces, fetch and parse the behavior tree, and arm the
    /// distributor's subscriptions. Step 7 (transition EXECUTE, publish
    /// Start SUCCESS) is left to the caller.
    async fn run_starting_procedure(self: &Arc<Self>, process_id: &str) -> Result<Arc<Tree>, ControllerError> {
        let required_capabilities = self.aas_client.fetch_required_capabilities(process_id).await?;
        let mut equipment_map = build_equipment_map(&required_capabilities);

        match self.fetch_product_reference(process_id).await {
            Ok(Some(product_id)) => {
                equipment_map.insert("product".to_string(), product_id);
            }
            Ok(None) => debug!(process_id, "process AAS has no ProductReference"),
            Err(e) => warn!(error = %e, process_id, "failed to fetch ProcessInformation"),
        }

        let mut prefetched = 0usize;
        for (asset_name, shell_id) in &equipment_map {
            match self.interface_cache.prefetch(asset_name, shell_id).await {
                Ok(()) => prefetched += 1,
                Err(e) => warn!(error = %e, asset_name, shell_id, "failed to prefetch asset interfaces"),
            }
        }
        if prefetched == 0 && !equipment_map.is_empty() {
            return Err(ControllerError::TreeBuild(
                "no asset interfaces could be pre-fetched".to_string(),
            ));
        }

        let bt_url = self.aas_client.fetch_policy_bt_url(process_id).await?;
        let xml_text = self.aas_client.fetch_url_text(&bt_url).await?;

        let blackboard = Arc::new(Blackboard::new());
        blackboard.set_equipment_map(equipment_map);
        blackboard.set("ProcessAASId", process_id);

        // §4.1 step 5: install an AAS provider for the tree, cached with
        // the 300s TTL §3's caching model specifies for the BT provider
        // (distinct from the interface cache's own 60s AAS-read TTL).
        let aas_provider = Arc::new(CachingAasProvider::new(
            AasClientProvider::new(self.aas_client.clone()),
            Duration::from_secs(300),
        ));

        let ctx = Arc::new(NodeContext {
            blackboard: blackboard.clone(),
            mqtt: self.mqtt.clone(),
            distributor: self.distributor.clone(),
            interface_cache: self.interface_cache.clone(),
            aas_client: self.aas_client.clone(),
            aas_provider,
        });

        let root = xml::build_tree(&xml_text, ctx, &self.distributor)?;
        let tree = Arc::new(Tree::new(root));

        // Resolve every node's topics before arming subscriptions: the
        // distributor only subscribes to what `NodeSubscriber::response_topics`
        // currently reports, and that is only populated once a node has
        // resolved its topics against the interface cache. Without this
        // pass every node resolves lazily on its first tick, so arming runs
        // over an empty set and no station response is ever dispatched.
        tree.prime().await;

        self.distributor
            .subscribe_for_active_tree(&self.mqtt)
            .await
            .map_err(|e| ControllerError::TreeBuild(e.to_string()))?;

        *self.blackboard.lock().expect("blackboard mutex poisoned") = Some(blackboard);

        Ok(tree)
    }

    async fn fetch_product_reference(&self, process_id: &str) -> Result<Option<String>, AasError> {
        let process_information = self.aas_client.fetch_process_information(process_id).await?;
        let elements = process_information
            .get("submodelElements")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let product_id = elements
            .iter()
            .find(|e| e.get("idShort").and_then(Value::as_str) == Some("ProductReference"))
            .and_then(|reference| reference.get("value"))
            .and_then(Value::as_array)
            .and_then(|keys| keys.last())
            .and_then(|key| key.get("value"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(product_id)
    }
}

/// Walks `RequiredCapabilities`' `SubmodelElementCollection` children,
/// each expected to carry a nested `References` collection of
/// `ReferenceElement`s, and derives an AAS shell id per resource.
///
/// Grounded directly on `fetchAndBuildEquipmentMapping` in
/// `BehaviorTreeController.cpp`.
fn build_equipment_map(required_capabilities: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let capabilities = required_capabilities
        .get("submodelElements")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    for capability in capabilities {
        if capability.get("modelType").and_then(Value::as_str) != Some("SubmodelElementCollection") {
            continue;
        }
        let Some(references) = capability
            .get("value")
            .and_then(Value::as_array)
            .and_then(|elements| elements.iter().find(|e| e.get("idShort").and_then(Value::as_str) == Some("References")))
        else {
            continue;
        };
        let Some(reference_elements) = references.get("value").and_then(Value::as_array) else {
            continue;
        };

        for reference_element in reference_elements {
            if reference_element.get("modelType").and_then(Value::as_str) != Some("ReferenceElement") {
                continue;
            }
            let Some(resource_id_short) = reference_element.get("idShort").and_then(Value::as_str) else {
                continue;
            };
            let Some(submodel_path) = reference_element
                .get("value")
                .and_then(Value::as_array)
                .and_then(|keys| keys.last())
                .and_then(|key| key.get("value"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if let Some(shell_id) = derive_shell_id(submodel_path) {
                map.entry(resource_id_short.to_string()).or_insert(shell_id);
            }
        }
    }
    map
}

/// `…/submodels/instances/{idShort}/…` → `{base}/aas/{idShort}`, where
/// `{base}` is everything before `/submodels/`.
fn derive_shell_id(submodel_path: &str) -> Option<String> {
    const INSTANCES_MARKER: &str = "/instances/";
    const SUBMODELS_MARKER: &str = "/submodels/";

    let instances_at = submodel_path.find(INSTANCES_MARKER)?;
    let after_instances = &submodel_path[instances_at + INSTANCES_MARKER.len()..];
    let id_short = after_instances.split('/').next()?;

    let submodels_at = submodel_path.find(SUBMODELS_MARKER)?;
    let base_url = &submodel_path[..submodels_at];

    Some(format!("{base_url}/aas/{id_short}"))
}

/// The `-g` CLI flag's output: a static enumeration of every node tag
/// `bt::xml::build_tree` understands, in `TreeNodesModel` form, mirroring
/// `BT::writeTreeNodesModelXML` in `BehaviorTreeController.cpp`'s
/// `handleGenerateXmlModelsOption`.
pub fn node_registration_xml() -> String {
    const NODE_IDS: [&str; 13] = [
        "Sequence",
        "Fallback",
        "BC_Fallback",
        "Async_BC_Fallback",
        "Action",
        "SyncCondition",
        "UseResource",
        "Occupy",
        "KeepRunningUntilEmpty",
        "GetProductFromQueue",
        "PopElement",
        "SamplingGate",
        "QualityControlGate",
    ];
    let mut xml = String::from("<TreeNodesModel>\n");
    for id in NODE_IDS {
        xml.push_str(&format!("  <Node ID=\"{id}\"/>\n"));
    }
    xml.push_str("</TreeNodesModel>\n");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_only_allowed_from_idle() {
        assert!(command_allowed(PackMlState::Idle, "Start"));
        assert!(!command_allowed(PackMlState::Execute, "Start"));
    }

    #[test]
    fn stop_allowed_from_any_state() {
        for state in [PackMlState::Idle, PackMlState::Execute, PackMlState::Suspended, PackMlState::Aborted] {
            assert!(command_allowed(state, "Stop"));
        }
    }

    #[test]
    fn reset_allowed_only_from_terminal_states() {
        assert!(command_allowed(PackMlState::Stopped, "Reset"));
        assert!(command_allowed(PackMlState::Complete, "Reset"));
        assert!(command_allowed(PackMlState::Aborted, "Reset"));
        assert!(!command_allowed(PackMlState::Execute, "Reset"));
        assert!(!command_allowed(PackMlState::Idle, "Reset"));
    }

    #[test]
    fn derive_shell_id_extracts_base_and_instance_id_short() {
        let path = "https://aas-repo.example/submodels/instances/press-1/submodel-elements/Foo";
        assert_eq!(
            derive_shell_id(path),
            Some("https://aas-repo.example/aas/press-1".to_string())
        );
    }

    #[test]
    fn derive_shell_id_is_none_without_both_markers() {
        assert_eq!(derive_shell_id("https://aas-repo.example/submodels/only"), None);
    }

    #[test]
    fn build_equipment_map_walks_nested_references() {
        let required_capabilities = json!({
            "submodelElements": [
                {
                    "modelType": "SubmodelElementCollection",
                    "idShort": "FillCapability",
                    "value": [
                        {
                            "modelType": "SubmodelElementCollection",
                            "idShort": "References",
                            "value": [
                                {
                                    "modelType": "ReferenceElement",
                                    "idShort": "press-1",
                                    "value": [
                                        {"value": "https://aas-repo.example/submodels/instances/press-1/submodel-elements/Foo"}
                                    ]
                                }
                            ]
                        }
                    ]
                }
            ]
        });
        let map = build_equipment_map(&required_capabilities);
        assert_eq!(
            map.get("press-1"),
            Some(&"https://aas-repo.example/aas/press-1".to_string())
        );
    }

    #[test]
    fn node_registration_xml_lists_every_known_tag() {
        let xml = node_registration_xml();
        assert!(xml.contains("ID=\"Sequence\""));
        assert!(xml.contains("ID=\"Occupy\""));
        assert!(xml.contains("ID=\"QualityControlGate\""));
    }
}
