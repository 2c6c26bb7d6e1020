//! Shared handles every node in the library needs: the blackboard, the
//! MQTT client/distributor pair, and the interface cache used to resolve
//! logical interactions to concrete topics (falling back to a direct AAS
//! query on a cache miss, per §4.5's `initialize_topics_from_aas` contract).

use crate::aas::client::AasClient;
use crate::aas::provider::AasProvider;
use crate::bt::blackboard::Blackboard;
use crate::error::AasError;
use crate::interface_cache::InterfaceCache;
use crate::mqtt::client::MqttClient;
use crate::mqtt::distributor::MessageDistributor;
use crate::mqtt::topic::TopicDescriptor;
use serde_json::Value;
use std::sync::Arc;

pub struct NodeContext {
    pub blackboard: Arc<Blackboard>,
    pub mqtt: MqttClient,
    pub distributor: Arc<MessageDistributor>,
    pub interface_cache: Arc<InterfaceCache>,
    pub aas_client: Arc<AasClient>,
    /// Path-addressable AAS lookup for nodes that read arbitrary submodel
    /// values rather than a topic interaction, cached with the 300s TTL
    /// §3's caching model specifies for the BT provider.
    pub aas_provider: Arc<dyn AasProvider>,
}

impl NodeContext {
    /// Resolve `(asset_id, interaction)` to its concrete topic, trying the
    /// interface cache first and falling back to a direct AAS interface
    /// fetch on a miss (the fallback the interface cache's own doc notes
    /// callers must perform).
    pub async fn resolve_topic(
        &self,
        asset_id: &str,
        interaction: &str,
        direction: crate::interface_cache::Direction,
    ) -> Option<TopicDescriptor> {
        if let Some(topic) = self
            .interface_cache
            .get(asset_id, interaction, direction)
            .await
        {
            return Some(topic);
        }
        let shell_id = self.blackboard.shell_id_for(asset_id)?;
        self.interface_cache.prefetch(asset_id, &shell_id).await.ok()?;
        self.interface_cache.get(asset_id, interaction, direction).await
    }

    /// Resolve a ModelReference-style path (`<submodelId>/<seg>/…`) against
    /// the tree's AAS provider, e.g. for nodes that read a submodel value
    /// directly rather than through a wire interaction.
    pub async fn get_aas_value(&self, path: &str) -> Result<Value, AasError> {
        self.aas_provider.get(path).await
    }
}
