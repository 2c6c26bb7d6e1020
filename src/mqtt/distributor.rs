//! Routes incoming MQTT messages to the behavior-tree nodes of the active
//! tree.
//!
//! Grounded on `NodeMessageDistributor` in
//! `original_source/BT_Controller/include/mqtt/node_message_distributor.h`
//! (and its `.cpp`): a `topic_handlers` list built once per tree arming
//! (maximum QoS across every subscriber of a topic, one subscription per
//! unique topic string) plus a `node_subscriptions` map keyed by node type
//! used to assemble it. The C++ distributor holds raw back-pointers to
//! nodes it does not own; here that is modelled as `Weak` references so a
//! torn-down tree's nodes are never kept alive by the distributor.

use crate::error::DistributorError;
use crate::mqtt::client::{MessageProps, MqttClient};
use crate::mqtt::topic::topic_matches;
use serde_json::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Implemented by every behavior-tree node type that wants to receive
/// MQTT messages. `response_topics` is consulted once per tree arming;
/// `process_message` is invoked on the MQTT delivery task and must not
/// block.
pub trait NodeSubscriber: Send + Sync {
    /// `(topic_key, concrete_or_pattern_topic, qos)` for every logical
    /// response interaction this node instance listens on.
    fn response_topics(&self) -> Vec<(String, String, u8)>;

    fn process_message(&self, topic_key: &str, topic: &str, payload: &Value, props: &MessageProps);
}

struct TopicHandler {
    topic: String,
    qos: u8,
    subscribed: bool,
    subscribers: Vec<(String, Weak<dyn NodeSubscriber>)>,
}

/// Always-live callback registered outside the per-tree arming cycle.
/// Mirrors the controller's own `CMD/Start|Stop|...` subscriptions in
/// `BehaviorTreeController::subscribeToTopics`, which stay active across
/// `RESETTING` even though every tree-node topic is torn down.
type ControlCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
pub struct MessageDistributor {
    topic_handlers: Mutex<Vec<TopicHandler>>,
    node_subscriptions: Mutex<HashMap<TypeId, Vec<Weak<dyn NodeSubscriber>>>>,
    control_handlers: Mutex<Vec<(String, ControlCallback)>>,
}

impl MessageDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node instance so it is considered the next time the tree
    /// is armed. Mirrors `registerDerivedInstance`.
    pub fn register<T: NodeSubscriber + 'static>(&self, instance: &Arc<T>) {
        let type_id = TypeId::of::<T>();
        let weak: Weak<dyn NodeSubscriber> = Arc::downgrade(instance) as Weak<dyn NodeSubscriber>;
        self.node_subscriptions
            .lock()
            .expect("node_subscriptions mutex poisoned")
            .entry(type_id)
            .or_default()
            .push(weak);
    }

    /// Drop a node instance's registration. Mirrors `unregisterInstance`;
    /// nodes call this from their `Drop` impl.
    pub fn unregister<T: NodeSubscriber + 'static>(&self, instance: &Arc<T>) {
        let type_id = TypeId::of::<T>();
        let mut subs = self
            .node_subscriptions
            .lock()
            .expect("node_subscriptions mutex poisoned");
        if let Some(list) = subs.get_mut(&type_id) {
            list.retain(|weak| {
                weak.upgrade()
                    .map(|strong| !Arc::ptr_eq(&strong, &(instance.clone() as Arc<dyn NodeSubscriber>)))
                    .unwrap_or(false)
            });
        }
    }

    /// Register a callback that fires for every message on `topic` for the
    /// lifetime of the distributor, independent of tree arming. Used for the
    /// controller's own command topics, which must survive
    /// `unsubscribe_all` (the "recreate fresh distributor" step of
    /// `RESETTING`, per DESIGN.md).
    pub fn register_control(&self, topic: impl Into<String>, callback: ControlCallback) {
        self.control_handlers
            .lock()
            .expect("control_handlers mutex poisoned")
            .push((topic.into(), callback));
    }

    /// Rebuild `topic_handlers` from every still-live registered instance
    /// and subscribe to every unique topic at the max QoS requested across
    /// its subscribers. Mirrors `subscribeToActiveNodes`.
    pub async fn subscribe_for_active_tree(
        &self,
        client: &MqttClient,
    ) -> Result<(), DistributorError> {
        let mut topic_to_subs: HashMap<String, Vec<(String, Weak<dyn NodeSubscriber>)>> =
            HashMap::new();
        let mut topic_to_qos: HashMap<String, u8> = HashMap::new();

        {
            let subs = self
                .node_subscriptions
                .lock()
                .expect("node_subscriptions mutex poisoned");
            for instances in subs.values() {
                for weak in instances {
                    let Some(instance) = weak.upgrade() else {
                        continue;
                    };
                    for (key, topic, qos) in instance.response_topics() {
                        topic_to_qos
                            .entry(topic.clone())
                            .and_modify(|existing| *existing = (*existing).max(qos))
                            .or_insert(qos);
                        topic_to_subs
                            .entry(topic)
                            .or_default()
                            .push((key, weak.clone()));
                    }
                }
            }
        }

        let mut handlers = Vec::with_capacity(topic_to_subs.len());
        for (topic, subscribers) in topic_to_subs {
            let qos = topic_to_qos.get(&topic).copied().unwrap_or(0);
            match client.subscribe(&topic, qos).await {
                Ok(()) => {
                    debug!(topic, qos, "subscribed for active tree");
                    handlers.push(TopicHandler {
                        topic,
                        qos,
                        subscribed: true,
                        subscribers,
                    });
                }
                Err(e) => {
                    warn!(topic, error = %e, "failed to subscribe");
                    handlers.push(TopicHandler {
                        topic,
                        qos,
                        subscribed: false,
                        subscribers,
                    });
                }
            }
        }

        *self
            .topic_handlers
            .lock()
            .expect("topic_handlers mutex poisoned") = handlers;
        Ok(())
    }

    /// Unsubscribe from every currently-subscribed topic; exactly one
    /// unsubscribe per prior subscribe.
    pub async fn unsubscribe_all(&self, client: &MqttClient) -> Result<(), DistributorError> {
        let handlers = std::mem::take(
            &mut *self
                .topic_handlers
                .lock()
                .expect("topic_handlers mutex poisoned"),
        );
        for handler in handlers.iter().filter(|h| h.subscribed) {
            if let Err(e) = client.unsubscribe(&handler.topic).await {
                warn!(topic = %handler.topic, error = %e, "failed to unsubscribe");
            }
        }
        self.node_subscriptions
            .lock()
            .expect("node_subscriptions mutex poisoned")
            .clear();
        Ok(())
    }

    /// Dispatch an incoming message to every subscriber whose registered
    /// topic matches, by MQTT wildcard semantics. Mirrors
    /// `handle_incoming_message`/`route_to_nodes`.
    pub fn dispatch(&self, topic: &str, payload: &Value, props: &MessageProps) {
        let mut handled = false;
        {
            let handlers = self
                .topic_handlers
                .lock()
                .expect("topic_handlers mutex poisoned");
            for handler in handlers.iter().filter(|h| h.subscribed) {
                if !topic_matches(&handler.topic, topic) {
                    continue;
                }
                for (key, weak) in &handler.subscribers {
                    if let Some(instance) = weak.upgrade() {
                        instance.process_message(key, topic, payload, props);
                        handled = true;
                    }
                }
            }
        }
        {
            let controls = self
                .control_handlers
                .lock()
                .expect("control_handlers mutex poisoned");
            for (pattern, callback) in controls.iter() {
                if topic_matches(pattern, topic) {
                    callback(payload);
                    handled = true;
                }
            }
        }
        if !handled {
            debug!(topic, "message had no matching subscriber");
        }
    }

    pub fn active_topic_patterns(&self) -> Vec<String> {
        self.topic_handlers
            .lock()
            .expect("topic_handlers mutex poisoned")
            .iter()
            .filter(|h| h.subscribed)
            .map(|h| h.topic.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        calls: AtomicUsize,
        topic: String,
    }

    impl NodeSubscriber for Counter {
        fn response_topics(&self) -> Vec<(String, String, u8)> {
            vec![("response".to_string(), self.topic.clone(), 1)]
        }

        fn process_message(&self, _key: &str, _topic: &str, _payload: &Value, _props: &MessageProps) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_without_subscribing_is_a_noop() {
        let distributor = MessageDistributor::new();
        let instance = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            topic: "uns/press-1/DATA/Occupy".to_string(),
        });
        distributor.register(&instance);
        // never subscribed (subscribe_for_active_tree not called) -> no handlers
        distributor.dispatch(
            "uns/press-1/DATA/Occupy",
            &json!({}),
            &MessageProps::default(),
        );
        assert_eq!(instance.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregister_stops_further_dispatch_accounting() {
        let distributor = MessageDistributor::new();
        let instance = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            topic: "uns/press-1/DATA/Occupy".to_string(),
        });
        distributor.register(&instance);
        distributor.unregister(&instance);
        let subs = distributor.node_subscriptions.lock().unwrap();
        assert!(subs.values().all(|v| v.is_empty()));
    }
}
