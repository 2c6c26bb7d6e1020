//! MQTT transport: connection lifecycle and the delivery task that feeds
//! the [`MessageDistributor`](crate::mqtt::distributor::MessageDistributor).
//!
//! The `statum` typestate pattern and `rumqttc::{AsyncClient, EventLoop}`
//! split mirror `mqtt/mqtt_handler.rs`'s `MQTTConnection<S: MQTTState>`,
//! simplified from three states to two: this controller has no
//! live-reconfiguration surface (config is loaded once at startup), so
//! `Initializing`/`Configured`/`Processing` collapses to
//! `Initializing`/`Connected`.

use crate::mqtt::distributor::MessageDistributor;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Packet, QoS};
use serde_json::Value;
use statum::{machine, state};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Placeholder for MQTT5-style user/message properties. `rumqttc` surfaces
/// these per-publish when the broker sets them; this crate only reads the
/// ones callers care about (currently none), so it is a simple string map
/// rather than a generated properties type.
pub type MessageProps = HashMap<String, String>;

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Cheaply cloneable handle used by everything that needs to publish,
/// subscribe, or unsubscribe. Wraps `rumqttc::AsyncClient`.
#[derive(Clone)]
pub struct MqttClient {
    inner: AsyncClient,
}

impl MqttClient {
    pub async fn publish(
        &self,
        topic: &str,
        qos: u8,
        retain: bool,
        payload: &Value,
    ) -> Result<(), rumqttc::ClientError> {
        let bytes = serde_json::to_vec(payload).expect("JSON payloads are always serializable");
        self.inner
            .publish(topic, qos_from_u8(qos), retain, bytes)
            .await
    }

    pub async fn subscribe(&self, topic: &str, qos: u8) -> Result<(), rumqttc::ClientError> {
        self.inner.subscribe(topic, qos_from_u8(qos)).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), rumqttc::ClientError> {
        self.inner.unsubscribe(topic).await
    }

    /// A client whose requests queue locally without a live broker
    /// connection. Used by node-runtime unit tests that need something to
    /// call `publish` on; nobody ever polls the paired event loop, so the
    /// bounded request channel is the only thing that could block, and no
    /// test publishes anywhere near its capacity.
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        let options = MqttOptions::new("test-client", "localhost", 1883);
        let (inner, _event_loop) = AsyncClient::new(options, 100);
        Self { inner }
    }
}

#[state]
#[derive(Debug, Clone, Copy)]
pub enum MqttLifecycle {
    Initializing,
    Connected,
}

#[machine]
pub struct MqttConnection<S: MqttLifecycle> {
    client: AsyncClient,
    event_loop: Option<rumqttc::EventLoop>,
}

impl MqttConnection<Initializing> {
    /// Parses `broker_uri` (`mqtt://host:port` or `host:port`), creates the
    /// underlying `rumqttc` client, and moves to `Connected`. Connection
    /// itself happens lazily on first `event_loop.poll()`, matching the
    /// teacher's `create()` pattern.
    pub fn create(broker_uri: &str, client_id: &str) -> Self {
        let stripped = broker_uri
            .trim_start_matches("mqtt://")
            .trim_start_matches("mqtts://");
        let mut parts = stripped.splitn(2, ':');
        let host = parts.next().unwrap_or("localhost");
        let port: u16 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1883);

        info!(broker_uri, client_id, "initializing MQTT connection");

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(10));

        let (client, event_loop) = AsyncClient::new(options, 100);

        Self::new(client, Some(event_loop))
    }

    pub fn connect(self) -> MqttConnection<Connected> {
        self.transition()
    }
}

impl MqttConnection<Connected> {
    /// Splits into a cloneable [`MqttClient`] handle and a background task
    /// that polls the event loop, decodes JSON publishes, and dispatches
    /// them through `distributor`. Moves the `EventLoop` into the spawned
    /// task while keeping `AsyncClient` shared.
    pub fn spawn(mut self, distributor: Arc<MessageDistributor>) -> (MqttClient, JoinHandle<()>) {
        let client = MqttClient {
            inner: self.client.clone(),
        };

        let mut event_loop = self
            .event_loop
            .take()
            .expect("event loop is present until spawned");

        let handle = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        match serde_json::from_slice::<Value>(&publish.payload) {
                            Ok(payload) => {
                                debug!(topic = %publish.topic, "received publish");
                                distributor.dispatch(&publish.topic, &payload, &MessageProps::default());
                            }
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "dropping non-JSON payload");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT broker connection established");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "MQTT event loop error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (client, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_mapping_is_total() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(200), QoS::ExactlyOnce);
    }

    #[test]
    fn create_strips_scheme_and_parses_port() {
        let conn = MqttConnection::create("mqtt://broker.local:1884", "cell-1");
        // smoke test: construction does not panic on a well-formed URI
        let _ = conn.connect();
    }
}
