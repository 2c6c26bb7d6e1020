//! Per-asset MQTT interface discovery, pre-fetched once during `STARTING`.
//!
//! Grounded on `fetchInterface` in
//! `original_source/BT_Controller/src/aas/aas_client.cpp`: walks an asset's
//! `AssetInterfacesDescription` submodel to build input/output topic
//! descriptors per interaction, honoring the response-collection override
//! for actions, and separately loads a `Variables` submodel to resolve
//! logical variable aliases to interaction names.

use crate::aas::client::AasClient;
use crate::bt::schema::{FieldType, Schema};
use crate::error::AasError;
use crate::mqtt::topic::TopicDescriptor;
use moka::future::Cache;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Debug, Default)]
pub struct AssetInterfaceSet {
    pub base_topic: String,
    /// interaction name (lowercased) -> (input, output)
    pub interactions: HashMap<String, (Option<TopicDescriptor>, Option<TopicDescriptor>)>,
    /// variable alias (lowercased) -> interaction name
    pub aliases: HashMap<String, String>,
}

pub struct InterfaceCache {
    client: Arc<AasClient>,
    assets: tokio::sync::RwLock<HashMap<String, AssetInterfaceSet>>,
    schema_cache: Cache<String, Value>,
}

impl InterfaceCache {
    pub fn new(client: Arc<AasClient>) -> Self {
        Self {
            client,
            assets: tokio::sync::RwLock::new(HashMap::new()),
            // Schema documents are immutable per URL, so this cache has no
            // TTL: unlike the 60s/300s AAS-read caches, an entry is only
            // ever invalidated by the process restarting.
            schema_cache: Cache::builder().build(),
        }
    }

    /// Pre-fetch the interface set for one asset and install it. Errors are
    /// logged and propagated; callers should tolerate per-asset failures
    /// during a multi-asset prefetch.
    pub async fn prefetch(&self, asset_id: &str, shell_id: &str) -> Result<(), AasError> {
        let interfaces_submodel = self
            .client
            .fetch_submodel_data(asset_id, "AssetInterfacesDescription")
            .await?;

        let interface_element = find_element(&interfaces_submodel, "InterfaceMQTT")
            .ok_or_else(|| AasError::InvalidStructure {
                reason: format!("{asset_id}: no InterfaceMQTT element"),
            })?;

        let base_topic = extract_base_topic(interface_element)?;

        let mut set = AssetInterfaceSet {
            base_topic: base_topic.clone(),
            ..Default::default()
        };

        for collection_name in ["actions", "properties"] {
            if let Some(elements) = find_collection(interface_element, collection_name) {
                for interaction in elements {
                    let Some(name) = interaction.get("idShort").and_then(Value::as_str) else {
                        continue;
                    };
                    if let Some((input, output)) =
                        self.build_topics(&base_topic, interaction).await
                    {
                        set.interactions
                            .insert(name.to_lowercase(), (input, output));
                    }
                }
            }
        }

        if let Ok(variables_submodel) =
            self.client.fetch_submodel_data(asset_id, "Variables").await
        {
            if let Some(elements) = variables_submodel
                .get("submodelElements")
                .and_then(Value::as_array)
            {
                for variable in elements {
                    let Some(var_name) = variable.get("idShort").and_then(Value::as_str) else {
                        continue;
                    };
                    if let Some(reference) = find_element(variable, "InterfaceReference") {
                        if let Some(interaction_name) = reference
                            .get("value")
                            .and_then(Value::as_array)
                            .and_then(|keys| keys.last())
                            .and_then(|k| k.get("value"))
                            .and_then(Value::as_str)
                        {
                            set.aliases
                                .insert(var_name.to_lowercase(), interaction_name.to_lowercase());
                        }
                    }
                }
            }
        }

        self.assets
            .write()
            .await
            .insert(asset_id.to_string(), set);
        debug!(asset_id, base_topic, "prefetched asset interfaces");
        Ok(())
    }

    async fn build_topics(
        &self,
        base_topic: &str,
        interaction: &Value,
    ) -> Option<(Option<TopicDescriptor>, Option<TopicDescriptor>)> {
        let forms = interaction
            .get("value")
            .and_then(Value::as_array)
            .and_then(|elements| find_element_in_slice(elements, "forms"))
            .or_else(|| find_element(interaction, "Forms"))?;

        let href = forms.get("href").and_then(Value::as_str)?;
        let qos = extract_qos(forms);
        let retain = extract_bool(forms, "mqv_retain").unwrap_or(false);

        let mut input_topic = TopicDescriptor::new(join_topic(base_topic, href), qos, retain);
        if let Some(schema) = self.resolve_schema(interaction, "input").await {
            input_topic = input_topic.with_schema(schema);
        }

        let mut output_topic = if let Some(response) = forms.get("response") {
            let response_href = response.get("href").and_then(Value::as_str).unwrap_or(href);
            let response_qos = extract_qos(response);
            let response_retain = extract_bool(response, "mqv_retain").unwrap_or(retain);
            TopicDescriptor::new(join_topic(base_topic, response_href), response_qos, response_retain)
        } else {
            TopicDescriptor::new(join_topic(base_topic, href), qos, retain)
        };
        if let Some(schema) = self.resolve_schema(interaction, "output").await {
            output_topic = output_topic.with_schema(schema);
        }

        Some((Some(input_topic), Some(output_topic)))
    }

    /// Find a file-type `input`/`output` element on the interaction whose
    /// value is a schema URL, fetch and cache it, and convert it into a
    /// structural predicate schema.
    async fn resolve_schema(&self, interaction: &Value, direction: &str) -> Option<Schema> {
        let url = find_element(interaction, direction)?
            .get("value")
            .and_then(Value::as_str)?;
        self.fetch_schema(url).await
    }

    async fn fetch_schema(&self, url: &str) -> Option<Schema> {
        if let Some(doc) = self.schema_cache.get(url).await {
            return Some(json_schema_to_predicate(&doc));
        }
        match self.client.fetch_url(url).await {
            Ok(doc) => {
                self.schema_cache.insert(url.to_string(), doc.clone()).await;
                Some(json_schema_to_predicate(&doc))
            }
            Err(e) => {
                warn!(url, error = %e, "failed to fetch schema document");
                None
            }
        }
    }

    /// `get(asset_id, interaction, "input"|"output")`: lowercases
    /// `interaction`, follows the variable alias map if the name matches an
    /// alias, then looks up the cached descriptor. Missing entries return
    /// `None`, never an error — see DESIGN.md's Open Question resolution.
    pub async fn get(
        &self,
        asset_id: &str,
        interaction: &str,
        direction: Direction,
    ) -> Option<TopicDescriptor> {
        let assets = self.assets.read().await;
        let set = assets.get(asset_id)?;
        let lower = interaction.to_lowercase();
        let resolved = set.aliases.get(&lower).cloned().unwrap_or(lower);
        let (input, output) = set.interactions.get(&resolved)?;
        match direction {
            Direction::Input => input.clone(),
            Direction::Output => output.clone(),
        }
    }

    /// Wildcard subscription patterns covering retained messages for every
    /// known asset: `<base>/#`.
    pub async fn wildcard_patterns(&self) -> Vec<String> {
        self.assets
            .read()
            .await
            .values()
            .map(|set| format!("{}/#", set.base_topic))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

fn find_element<'a>(parent: &'a Value, id_short: &str) -> Option<&'a Value> {
    parent
        .get("value")
        .or_else(|| parent.get("submodelElements"))
        .and_then(Value::as_array)
        .and_then(|elements| find_element_in_slice(elements, id_short))
}

fn find_element_in_slice<'a>(elements: &'a [Value], id_short: &str) -> Option<&'a Value> {
    elements
        .iter()
        .find(|e| e.get("idShort").and_then(Value::as_str) == Some(id_short))
}

fn find_collection<'a>(parent: &'a Value, id_short: &str) -> Option<&'a Vec<Value>> {
    find_element(parent, id_short)?.get("value").and_then(Value::as_array)
}

fn extract_base_topic(interface_element: &Value) -> Result<String, AasError> {
    let base = find_element(interface_element, "EndpointMetadata")
        .and_then(|md| find_element(md, "base"))
        .and_then(|b| b.get("value").and_then(Value::as_str))
        .ok_or_else(|| AasError::InvalidStructure {
            reason: "InterfaceMQTT missing EndpointMetadata/base".to_string(),
        })?;
    Ok(strip_mqtt_scheme(base))
}

fn strip_mqtt_scheme(base: &str) -> String {
    let without_scheme = base
        .trim_start_matches("mqtt://")
        .trim_start_matches("mqtts://");
    match without_scheme.find('/') {
        Some(idx) => without_scheme[idx + 1..].to_string(),
        None => String::new(),
    }
}

fn join_topic(base: &str, href: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), href.trim_start_matches('/'))
}

fn extract_qos(forms: &Value) -> u8 {
    match forms.get("mqv_qos") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as u8,
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Converts a JSON Schema document's top-level `required`/`properties`
/// into a structural predicate. No `$ref`, `oneOf`, or nested-schema
/// resolution, matching the scope boundary documented in DESIGN.md.
fn json_schema_to_predicate(doc: &Value) -> Schema {
    let mut schema = Schema::new();
    let required = doc
        .get("required")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    let properties = doc.get("properties").and_then(Value::as_object);

    for field in required {
        let ty = properties
            .and_then(|props| props.get(field))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            .map(field_type_from_json_schema_type)
            .unwrap_or(FieldType::Any);
        schema = schema.require(field, ty);
    }
    schema
}

fn field_type_from_json_schema_type(ty: &str) -> FieldType {
    match ty {
        "string" => FieldType::String,
        "number" | "integer" => FieldType::Number,
        "boolean" => FieldType::Bool,
        "object" => FieldType::Object,
        "array" => FieldType::Array,
        _ => FieldType::Any,
    }
}

fn extract_bool(value: &Value, key: &str) -> Option<bool> {
    match value.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => Some(s == "true"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_mqtt_scheme_and_authority() {
        assert_eq!(strip_mqtt_scheme("mqtt://broker.local:1883/press-1"), "press-1");
        assert_eq!(strip_mqtt_scheme("mqtts://broker.local:8883/press-1"), "press-1");
    }

    #[test]
    fn joins_base_and_href_normalising_slashes() {
        assert_eq!(join_topic("press-1", "/CMD/Occupy"), "press-1/CMD/Occupy");
        assert_eq!(join_topic("press-1/", "CMD/Occupy"), "press-1/CMD/Occupy");
    }

    #[test]
    fn json_schema_to_predicate_reads_required_and_types() {
        let doc = serde_json::json!({
            "required": ["Uuid", "TargetPosition"],
            "properties": {
                "Uuid": {"type": "string"},
                "TargetPosition": {"type": "integer"}
            }
        });
        let schema = json_schema_to_predicate(&doc);
        assert!(schema.validate(&serde_json::json!({"Uuid": "abc", "TargetPosition": 3})));
        assert!(!schema.validate(&serde_json::json!({"Uuid": "abc"})));
    }

    #[test]
    fn extract_qos_accepts_int_or_string() {
        assert_eq!(extract_qos(&serde_json::json!({"mqv_qos": 2})), 2);
        assert_eq!(extract_qos(&serde_json::json!({"mqv_qos": "1"})), 1);
        assert_eq!(extract_qos(&serde_json::json!({})), 0);
    }
}
