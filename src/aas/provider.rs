//! The behavior tree's view into AAS: a path-addressable key/value provider,
//! with an optional TTL cache.
//!
//! Grounded on `AASClientProvider`/`createCachingAASProvider` in
//! `original_source/BT_Controller/include/aas/aas_client_provider.h`:
//! ModelReference-style paths (`<submodelId>/<idShort>/.../<idShort>`) are
//! resolved against the submodel repository; AAS-shell-first paths are
//! rejected outright per the AAS metamodel (a ModelReference into submodel
//! content must start with the submodel, not the shell — the shell only
//! references submodels, it does not contain their elements).

use crate::aas::client::AasClient;
use crate::error::AasError;
use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait AasProvider: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value, AasError>;
}

/// Split a ModelReference-style path into `(submodel_id, element_path)`.
/// Paths beginning `…/aas/…`, containing `/shell`, or `urn:aas:` are
/// rejected as AAS-shell-first references.
pub fn parse_model_reference_path(path: &str) -> Result<(String, Vec<&str>), AasError> {
    let is_url = path.starts_with("http://") || path.starts_with("https://") || path.starts_with("urn:");

    let submodel_id_end = if is_url {
        let marker_pos = ["/sm/", "/submodel/"]
            .iter()
            .find_map(|marker| path.find(marker).map(|pos| (pos, marker.len())));

        match marker_pos {
            Some((pos, marker_len)) => {
                let name_start = pos + marker_len;
                path[name_start..]
                    .find('/')
                    .map(|rel| name_start + rel)
                    .unwrap_or(path.len())
            }
            None => path.find('/').unwrap_or(path.len()),
        }
    } else {
        path.find('/').ok_or_else(|| AasError::InvalidStructure {
            reason: format!("path '{path}' has no element navigation"),
        })?
    };

    let candidate_id = &path[..submodel_id_end];
    if candidate_id.contains("/aas/") || candidate_id.contains("/shell") || candidate_id.starts_with("urn:aas:")
    {
        return Err(AasError::ShellFirstReference {
            path: path.to_string(),
        });
    }

    if submodel_id_end >= path.len() {
        return Err(AasError::InvalidStructure {
            reason: format!("path '{path}' has no element navigation after the submodel id"),
        });
    }

    let element_path: Vec<&str> = path[submodel_id_end + 1..]
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    if element_path.is_empty() {
        return Err(AasError::InvalidStructure {
            reason: format!("path '{path}' resolved to an empty element path"),
        });
    }

    Ok((candidate_id.to_string(), element_path))
}

pub struct AasClientProvider {
    client: Arc<AasClient>,
}

impl AasClientProvider {
    pub fn new(client: Arc<AasClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AasProvider for AasClientProvider {
    async fn get(&self, path: &str) -> Result<Value, AasError> {
        let (submodel_id, element_path) = parse_model_reference_path(path)?;
        let submodel = self.client.fetch_submodel_by_id(&submodel_id).await?;
        AasClient::resolve_property_path(&submodel, &element_path).cloned()
    }
}

trait CloneValue {
    fn cloned(self) -> Result<Value, AasError>;
}

impl CloneValue for Result<&Value, AasError> {
    fn cloned(self) -> Result<Value, AasError> {
        self.map(|v| v.clone())
    }
}

/// Wraps any [`AasProvider`] with a TTL cache keyed by path. Default TTL is
/// 60s for interface-cache usage, 300s when used as the tree's provider.
pub struct CachingAasProvider<P: AasProvider> {
    inner: P,
    cache: Cache<String, Value>,
}

impl<P: AasProvider> CachingAasProvider<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        let cache = Cache::builder().time_to_live(ttl).build();
        Self { inner, cache }
    }

    pub fn with_default_ttl(inner: P) -> Self {
        Self::new(inner, Duration::from_secs(60))
    }
}

#[async_trait]
impl<P: AasProvider> AasProvider for CachingAasProvider<P> {
    async fn get(&self, path: &str) -> Result<Value, AasError> {
        if let Some(cached) = self.cache.get(path).await {
            return Ok(cached);
        }
        let value = self.inner.get(path).await?;
        self.cache.insert(path.to_string(), value.clone()).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_shell_first_url_path() {
        let result = parse_model_reference_path(
            "https://smartproductionlab.aau.dk/aas/Press1/Location/x",
        );
        assert!(matches!(result, Err(AasError::ShellFirstReference { .. })));
    }

    #[test]
    fn accepts_submodel_first_url_path() {
        let (id, elements) = parse_model_reference_path(
            "https://smartproductionlab.aau.dk/sm/HierarchicalStructures/EntryNode/Dispensing/Location/x",
        )
        .unwrap();
        assert_eq!(id, "https://smartproductionlab.aau.dk/sm/HierarchicalStructures");
        assert_eq!(elements, vec!["EntryNode", "Dispensing", "Location", "x"]);
    }

    #[test]
    fn accepts_simple_path() {
        let (id, elements) = parse_model_reference_path("urn:submodel:Press/Location/x").unwrap();
        assert_eq!(id, "urn:submodel:Press");
        assert_eq!(elements, vec!["Location", "x"]);
    }

    #[test]
    fn rejects_urn_aas_prefix() {
        let result = parse_model_reference_path("urn:aas:Press1/Location/x");
        assert!(matches!(result, Err(AasError::ShellFirstReference { .. })));
    }
}
