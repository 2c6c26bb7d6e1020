//! Orchestrator configuration, loaded once at startup from YAML.
//!
//! Shape and loading mechanics follow the explicit-sections-plus-`dirs`-
//! based-home-lookup pattern this codebase uses elsewhere for configuration,
//! but this crate loads a single static document rather than a
//! session-switchable, autosaving portal: the orchestrator has no
//! persistence surface to back, so there is nothing here to converge on
//! at runtime.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CONFIG_DIR: &str = ".config/cell-orchestrator";
const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttSection {
    pub broker_uri: String,
    pub client_id: String,
    pub uns_topic: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_uri: "mqtt://localhost:1883".to_string(),
            client_id: "cell-orchestrator".to_string(),
            uns_topic: "uns".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AasSection {
    pub server_url: String,
    pub registry_url: String,
}

impl Default for AasSection {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8081".to_string(),
            registry_url: "http://localhost:8082".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Groot2Section {
    pub port: u16,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct BehaviorTreeSection {
    pub generate_xml_models: bool,
    pub description_path: PathBuf,
    pub nodes_path: PathBuf,
}

impl Default for BehaviorTreeSection {
    fn default() -> Self {
        Self {
            generate_xml_models: false,
            description_path: PathBuf::from("trees"),
            nodes_path: PathBuf::from("nodes.xml"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RegistrationSection {
    pub config_path: PathBuf,
    pub topic_pattern: String,
}

impl Default for RegistrationSection {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("registration.yaml"),
            topic_pattern: "{client_id}/registration".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct OrchestratorConfig {
    pub mqtt: MqttSection,
    pub aas: AasSection,
    pub groot2: Groot2Section,
    pub behavior_tree: BehaviorTreeSection,
    pub registration: RegistrationSection,
}

impl OrchestratorConfig {
    /// Resolved registration topic with `{client_id}` substituted.
    pub fn registration_topic(&self) -> String {
        self.registration
            .topic_pattern
            .replace("{client_id}", &self.mqtt.client_id)
    }

    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| {
            warn!("could not determine home directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(DEFAULT_CONFIG_FILE);
        path
    }

    /// Load from `path` if given, otherwise from the platform config
    /// directory; falls back to defaults if neither exists.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };

        if !tokio::fs::try_exists(&resolved).await? {
            info!(
                path = %resolved.display(),
                "no configuration file found, using defaults"
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&resolved).await?;
        let config: Self = serde_yaml::from_str(&content)?;
        info!(path = %resolved.display(), "loaded configuration");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_topic_substitutes_client_id() {
        let mut cfg = OrchestratorConfig::default();
        cfg.mqtt.client_id = "cell-7".to_string();
        cfg.registration.topic_pattern = "{client_id}/registration".to_string();
        assert_eq!(cfg.registration_topic(), "cell-7/registration");
    }

    #[test]
    fn deserializes_minimal_yaml_with_defaults() {
        let yaml = r#"
mqtt:
  broker_uri: "mqtt://broker:1883"
  client_id: "cell-1"
  uns_topic: "factory"
aas:
  server_url: "http://aas:8081"
  registry_url: "http://aas:8082"
groot2:
  port: 1667
behavior_tree:
  generate_xml_models: false
  description_path: "trees"
  nodes_path: "nodes.xml"
registration:
  config_path: "registration.yaml"
  topic_pattern: "{client_id}/registration"
"#;
        let cfg: OrchestratorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.mqtt.client_id, "cell-1");
        assert_eq!(cfg.groot2.port, 1667);
    }
}
