//! HTTP client for the Asset Administration Shell (AAS) registry and
//! repository.
//!
//! Grounded on `original_source/BT_Controller/src/aas/aas_client.cpp` and
//! `include/aas/aas_client.h`: base64url id encoding without padding,
//! JSON GET requests with a fixed timeout, and the recursive submodel
//! element property-path search. `libcurl` is replaced by `reqwest`
//! (already present elsewhere in the example pack) as the HTTP transport.

use crate::error::AasError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AasClient {
    repository_url: String,
    registry_url: String,
    http: reqwest::Client,
}

impl AasClient {
    pub fn new(repository_url: impl Into<String>, registry_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client configuration is always valid");
        Self {
            repository_url: repository_url.into(),
            registry_url: registry_url.into(),
            http,
        }
    }

    fn encode_id(id: &str) -> String {
        URL_SAFE_NO_PAD.encode(id.as_bytes())
    }

    async fn get_json(&self, url: &str) -> Result<Value, AasError> {
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AasError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let value = response.json::<Value>().await?;
        Ok(value)
    }

    /// Fetch an arbitrary absolute URL as JSON (used for AAS-referenced
    /// resources that live outside the repository/registry split, such as
    /// schema documents and behavior-tree XML hosted elsewhere).
    pub async fn fetch_url(&self, url: &str) -> Result<Value, AasError> {
        self.get_json(url).await
    }

    /// Fetch an arbitrary absolute URL as raw text (behavior-tree XML is
    /// not JSON).
    pub async fn fetch_url_text(&self, url: &str) -> Result<String, AasError> {
        let response = self
            .http
            .get(url)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AasError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }

    pub async fn fetch_shell(&self, shell_id: &str) -> Result<Value, AasError> {
        let url = format!(
            "{}/shells/{}",
            self.repository_url,
            Self::encode_id(shell_id)
        );
        self.get_json(&url).await
    }

    pub async fn fetch_submodel_by_id(&self, submodel_id: &str) -> Result<Value, AasError> {
        let url = format!(
            "{}/submodels/{}",
            self.repository_url,
            Self::encode_id(submodel_id)
        );
        self.get_json(&url).await
    }

    /// Look up the shell whose `globalAssetId` equals `asset_id` by
    /// scanning the registry's shell descriptors.
    pub async fn lookup_aas_id_from_asset_id(&self, asset_id: &str) -> Result<String, AasError> {
        let url = format!("{}/shell-descriptors", self.registry_url);
        let descriptors = self.get_json(&url).await?;

        let result = descriptors
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| AasError::InvalidStructure {
                reason: "shell-descriptors response missing 'result' array".to_string(),
            })?;

        for descriptor in result {
            if descriptor.get("globalAssetId").and_then(Value::as_str) == Some(asset_id) {
                return descriptor
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| AasError::InvalidStructure {
                        reason: "shell descriptor missing 'id'".to_string(),
                    });
            }
        }

        Err(AasError::NotFound {
            path: format!("asset {asset_id}"),
        })
    }

    /// Locate the first submodel reference on `shell` whose last key
    /// contains `id_short_fragment`, then fetch that submodel's document.
    pub async fn fetch_submodel_data(
        &self,
        asset_id: &str,
        id_short_fragment: &str,
    ) -> Result<Value, AasError> {
        let shell_id = self.lookup_aas_id_from_asset_id(asset_id).await?;
        let shell = self.fetch_shell(&shell_id).await?;

        let submodels = shell
            .get("submodels")
            .and_then(Value::as_array)
            .ok_or_else(|| AasError::InvalidStructure {
                reason: "shell missing 'submodels' reference list".to_string(),
            })?;

        for reference in submodels {
            let keys = reference
                .get("keys")
                .and_then(Value::as_array)
                .ok_or_else(|| AasError::InvalidStructure {
                    reason: "submodel reference missing 'keys'".to_string(),
                })?;
            let Some(last_key) = keys.last().and_then(|k| k.get("value")).and_then(Value::as_str)
            else {
                continue;
            };
            if last_key.contains(id_short_fragment) {
                return self.fetch_submodel_by_id(last_key).await;
            }
        }

        Err(AasError::NotFound {
            path: format!("{asset_id}/{id_short_fragment}"),
        })
    }

    /// Fetch the process AAS's `RequiredCapabilities` submodel, listing the
    /// equipment a station's behavior tree is allowed to address.
    pub async fn fetch_required_capabilities(&self, process_id: &str) -> Result<Value, AasError> {
        self.fetch_submodel_data(process_id, "RequiredCapabilities")
            .await
    }

    /// Fetch the process AAS's `ProcessInformation` submodel, carrying the
    /// product reference and other order-level metadata.
    pub async fn fetch_process_information(&self, process_id: &str) -> Result<Value, AasError> {
        self.fetch_submodel_data(process_id, "ProcessInformation")
            .await
    }

    /// Fetch the process AAS's `Policy` submodel and extract the URL of the
    /// behavior-tree XML document it references.
    pub async fn fetch_policy_bt_url(&self, process_id: &str) -> Result<String, AasError> {
        let policy = self.fetch_submodel_data(process_id, "Policy").await?;
        Self::resolve_property_path(&policy, &["BehaviorTree"])?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AasError::InvalidStructure {
                reason: "Policy/BehaviorTree is not a string value".to_string(),
            })
    }

    /// Recursive submodel-element property search, per
    /// `AASClientProvider::get` / the original's path walk: at each level,
    /// find the element whose `idShort` equals the current key; when the
    /// final key is reached, return its value (preferring `value`, falling
    /// back to `valueId`); otherwise descend into `value`/`statements`.
    pub fn resolve_property_path<'a>(
        submodel: &'a Value,
        path: &[&str],
    ) -> Result<&'a Value, AasError> {
        let elements = submodel
            .get("submodelElements")
            .and_then(Value::as_array)
            .ok_or_else(|| AasError::InvalidStructure {
                reason: "submodel missing 'submodelElements'".to_string(),
            })?;
        Self::resolve_in_elements(elements, path)
    }

    fn resolve_in_elements<'a>(elements: &'a [Value], path: &[&str]) -> Result<&'a Value, AasError> {
        let Some((head, rest)) = path.split_first() else {
            return Err(AasError::NotFound {
                path: String::new(),
            });
        };

        if let Some(element) = elements
            .iter()
            .find(|e| e.get("idShort").and_then(Value::as_str) == Some(*head))
        {
            if rest.is_empty() {
                return element
                    .get("value")
                    .or_else(|| element.get("valueId"))
                    .ok_or_else(|| AasError::InvalidStructure {
                        reason: format!("element '{head}' has neither 'value' nor 'valueId'"),
                    });
            }

            if let Some(children) = element
                .get("value")
                .and_then(Value::as_array)
                .or_else(|| element.get("statements").and_then(Value::as_array))
            {
                return Self::resolve_in_elements(children, rest);
            }

            return Err(AasError::NotFound {
                path: head.to_string(),
            });
        }

        // Breadth-preserving fallback: look for the same key nested under
        // any child's collection, in document order.
        for element in elements {
            if let Some(children) = element
                .get("value")
                .and_then(Value::as_array)
                .or_else(|| element.get("statements").and_then(Value::as_array))
            {
                if let Ok(found) = Self::resolve_in_elements(children, path) {
                    return Ok(found);
                }
            }
        }

        Err(AasError::NotFound {
            path: head.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_top_level_property() {
        let submodel = json!({
            "submodelElements": [
                {"idShort": "Temperature", "value": 42}
            ]
        });
        let value = AasClient::resolve_property_path(&submodel, &["Temperature"]).unwrap();
        assert_eq!(value, &json!(42));
    }

    #[test]
    fn descends_into_nested_collection() {
        let submodel = json!({
            "submodelElements": [
                {
                    "idShort": "Location",
                    "value": [
                        {"idShort": "x", "value": 1.5},
                        {"idShort": "y", "value": 2.5}
                    ]
                }
            ]
        });
        let value = AasClient::resolve_property_path(&submodel, &["Location", "y"]).unwrap();
        assert_eq!(value, &json!(2.5));
    }

    #[test]
    fn missing_path_is_not_found() {
        let submodel = json!({"submodelElements": []});
        assert!(AasClient::resolve_property_path(&submodel, &["Missing"]).is_err());
    }

    #[test]
    fn base64url_has_no_padding() {
        let encoded = AasClient::encode_id("https://example.org/sm/MySubmodel");
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
    }
}
