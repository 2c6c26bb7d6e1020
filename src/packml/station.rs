//! The station-side PackML wire contract (§4.6): the queue/state machine
//! embedded in each physical station, defining the Occupy/Release/command
//! protocol the orchestrator's node library (`bt::nodes`) speaks against.
//!
//! Grounded on `PackMLStateMachine` in
//! `original_source/PackML_Stations/Physical-Stations/src/PackMLStateMachine.cpp`:
//! a single queue of pending UUIDs plus a disjoint set of UUIDs still
//! awaiting their terminal Occupy acknowledgment ("pending registrations"),
//! a front-of-queue gate on command execution, and state transitions that
//! chain automatically (`IDLE` → `STARTING` on a non-empty queue,
//! `STARTING` → `EXECUTE` or `RESETTING` depending on queue contents).
//! This struct is the reference embedding; the orchestrator never
//! constructs one itself — it only talks this protocol as an MQTT client.

use crate::error::ControllerError;
use crate::mqtt::client::MqttClient;
use crate::packml::state::PackMlState;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::warn;

type ProcessFn = dyn Fn() -> Result<(), String> + Send + Sync;

struct CommandHandler {
    cmd_topic: String,
    data_topic: String,
    process_fn: Arc<ProcessFn>,
}

#[derive(Default)]
struct Queue {
    uuids: Vec<String>,
    pending_registrations: HashSet<String>,
    processing: Option<String>,
}

pub struct StationController {
    base_topic: String,
    mqtt: MqttClient,
    state: Mutex<PackMlState>,
    queue: Mutex<Queue>,
    handlers: Mutex<Vec<CommandHandler>>,
}

impl StationController {
    pub fn new(base_topic: impl Into<String>, mqtt: MqttClient) -> Arc<Self> {
        Arc::new(Self {
            base_topic: base_topic.into(),
            mqtt,
            state: Mutex::new(PackMlState::Idle),
            queue: Mutex::new(Queue::default()),
            handlers: Mutex::new(Vec::new()),
        })
    }

    fn occupy_cmd_topic(&self) -> String {
        format!("{}/CMD/Occupy", self.base_topic)
    }

    fn release_cmd_topic(&self) -> String {
        format!("{}/CMD/Release", self.base_topic)
    }

    /// Register a `(cmd_topic, data_topic, process_fn)` triple, mirroring
    /// `registerCommandHandler`. `process_fn` runs synchronously on the
    /// control loop and its `Err` becomes a `FAILURE` response.
    pub fn register_command_handler(
        &self,
        cmd_topic: impl Into<String>,
        data_topic: impl Into<String>,
        process_fn: Arc<ProcessFn>,
    ) {
        self.handlers.lock().expect("handlers mutex poisoned").push(CommandHandler {
            cmd_topic: cmd_topic.into(),
            data_topic: data_topic.into(),
            process_fn,
        });
    }

    /// Subscribes to `CMD/Occupy`, `CMD/Release`, and every registered
    /// command topic. Safe to call more than once; re-subscribing an
    /// already-subscribed topic is harmless at the broker.
    pub async fn subscribe_to_topics(&self) -> Result<(), ControllerError> {
        self.mqtt.subscribe(&self.occupy_cmd_topic(), 2).await?;
        self.mqtt.subscribe(&self.release_cmd_topic(), 2).await?;
        let cmd_topics: Vec<String> = self
            .handlers
            .lock()
            .expect("handlers mutex poisoned")
            .iter()
            .map(|h| h.cmd_topic.clone())
            .collect();
        for topic in cmd_topics {
            self.mqtt.subscribe(&topic, 2).await?;
        }
        Ok(())
    }

    pub async fn handle_message(self: &Arc<Self>, topic: &str, payload: &Value) {
        let Some(uuid) = payload.get("Uuid").and_then(Value::as_str).map(str::to_string) else {
            warn!(topic, "station message missing Uuid, dropping");
            return;
        };

        if topic == self.occupy_cmd_topic() {
            self.occupy_command(uuid).await;
            return;
        }
        if topic == self.release_cmd_topic() {
            self.release_command(uuid).await;
            return;
        }

        let matched = self
            .handlers
            .lock()
            .expect("handlers mutex poisoned")
            .iter()
            .find(|h| h.cmd_topic == topic)
            .map(|h| (h.data_topic.clone(), h.process_fn.clone()));

        if let Some((data_topic, process_fn)) = matched {
            self.execute_command(&uuid, &data_topic, process_fn.as_ref()).await;
        }
    }

    fn current_state(&self) -> PackMlState {
        *self.state.lock().expect("state mutex poisoned")
    }

    async fn occupy_command(self: &Arc<Self>, uuid: String) {
        let already_present = {
            let queue = self.queue.lock().expect("queue mutex poisoned");
            queue.uuids.contains(&uuid) || queue.processing.as_deref() == Some(uuid.as_str())
        };
        if already_present {
            warn!(uuid, "duplicate Occupy ignored");
            return;
        }

        {
            let mut queue = self.queue.lock().expect("queue mutex poisoned");
            queue.uuids.push(uuid.clone());
            queue.pending_registrations.insert(uuid.clone());
        }
        self.publish_occupy_response(&uuid, "RUNNING").await;

        if self.current_state() == PackMlState::Idle {
            self.transition_to(PackMlState::Starting).await;
        }
    }

    async fn release_command(self: &Arc<Self>, uuid: String) {
        let currently_processing = {
            let queue = self.queue.lock().expect("queue mutex poisoned");
            queue.processing.as_deref() == Some(uuid.as_str())
        };
        if currently_processing {
            self.publish_release_response(&uuid, "FAILURE").await;
            return;
        }

        let (removed, was_pending) = {
            let mut queue = self.queue.lock().expect("queue mutex poisoned");
            match queue.uuids.iter().position(|u| u == &uuid) {
                Some(idx) => {
                    queue.uuids.remove(idx);
                    (true, queue.pending_registrations.remove(&uuid))
                }
                None => (false, false),
            }
        };

        if !removed {
            self.publish_release_response(&uuid, "FAILURE").await;
            return;
        }
        if was_pending {
            self.publish_occupy_response(&uuid, "FAILURE").await;
        }
        self.publish_release_response(&uuid, "SUCCESS").await;

        let queue_empty = self.queue.lock().expect("queue mutex poisoned").uuids.is_empty();
        self.transition_to(if queue_empty { PackMlState::Resetting } else { PackMlState::Starting }).await;
    }

    async fn execute_command(&self, uuid: &str, data_topic: &str, process_fn: &ProcessFn) {
        if self.current_state() != PackMlState::Execute {
            return;
        }
        let is_head = self.queue.lock().expect("queue mutex poisoned").uuids.first().map(String::as_str) == Some(uuid);
        if !is_head {
            return;
        }

        self.queue.lock().expect("queue mutex poisoned").processing = Some(uuid.to_string());
        self.publish_verb_response(data_topic, uuid, "RUNNING").await;

        match process_fn() {
            Ok(()) => self.publish_verb_response(data_topic, uuid, "SUCCESS").await,
            Err(reason) => {
                warn!(uuid, reason, "station command process function failed");
                self.publish_verb_response(data_topic, uuid, "FAILURE").await;
            }
        }

        self.queue.lock().expect("queue mutex poisoned").processing = None;
    }

    /// Clears the queue, fails every pending Occupy, and transitions to
    /// `ABORTED`.
    pub async fn abort_command(self: &Arc<Self>) {
        let pending: Vec<String> = {
            let mut queue = self.queue.lock().expect("queue mutex poisoned");
            let pending = queue.pending_registrations.drain().collect();
            queue.uuids.clear();
            queue.processing = None;
            pending
        };
        for uuid in pending {
            self.publish_occupy_response(&uuid, "FAILURE").await;
        }
        self.transition_to(PackMlState::Aborted).await;
    }

    /// Sets state, publishes it, and chains the `IDLE`/`STARTING`/
    /// `RESETTING` auto-transitions `idleState`/`startingState` perform in
    /// the original. An explicit loop rather than recursion since the
    /// chain is only ever a few hops and async fns cannot recurse without
    /// boxing.
    async fn transition_to(self: &Arc<Self>, mut next: PackMlState) {
        loop {
            self.set_state(next).await;
            next = match next {
                PackMlState::Idle => {
                    let has_work = !self.queue.lock().expect("queue mutex poisoned").uuids.is_empty();
                    if has_work {
                        PackMlState::Starting
                    } else {
                        break;
                    }
                }
                PackMlState::Starting => {
                    let (is_empty, head) = {
                        let queue = self.queue.lock().expect("queue mutex poisoned");
                        (queue.uuids.is_empty(), queue.uuids.first().cloned())
                    };
                    if is_empty {
                        PackMlState::Resetting
                    } else {
                        if let Some(head_uuid) = head {
                            let was_pending = self
                                .queue
                                .lock()
                                .expect("queue mutex poisoned")
                                .pending_registrations
                                .remove(&head_uuid);
                            if was_pending {
                                self.publish_occupy_response(&head_uuid, "SUCCESS").await;
                            }
                        }
                        PackMlState::Execute
                    }
                }
                PackMlState::Resetting => PackMlState::Idle,
                _ => break,
            };
        }
    }

    async fn set_state(&self, new_state: PackMlState) {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        self.publish_state().await;
    }

    async fn publish_state(&self) {
        let queue = self.queue.lock().expect("queue mutex poisoned").uuids.clone();
        let payload = serde_json::json!({
            "State": self.current_state().as_str(),
            "TimeStamp": chrono::Utc::now().to_rfc3339(),
            "ProcessQueue": queue,
        });
        let topic = format!("{}/DATA/State", self.base_topic);
        if let Err(e) = self.mqtt.publish(&topic, 2, true, &payload).await {
            warn!(error = %e, "failed to publish station state");
        }
    }

    async fn publish_occupy_response(&self, uuid: &str, state: &str) {
        self.publish_verb_response(&format!("{}/DATA/Occupy", self.base_topic), uuid, state).await;
    }

    async fn publish_release_response(&self, uuid: &str, state: &str) {
        self.publish_verb_response(&format!("{}/DATA/Release", self.base_topic), uuid, state).await;
    }

    async fn publish_verb_response(&self, data_topic: &str, uuid: &str, state: &str) {
        let payload = serde_json::json!({
            "Uuid": uuid,
            "State": state,
            "TimeStamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.mqtt.publish(data_topic, 2, false, &payload).await {
            warn!(error = %e, data_topic, "failed to publish station command response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_rejects_duplicate_uuid_across_queue_and_processing() {
        let mut queue = Queue::default();
        queue.uuids.push("u1".to_string());
        queue.processing = Some("u2".to_string());
        assert!(queue.uuids.contains(&"u1".to_string()));
        assert_eq!(queue.processing.as_deref(), Some("u2"));
    }
}
