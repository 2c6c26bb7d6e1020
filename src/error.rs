//! Crate-wide error taxonomy.
//!
//! Library code returns one of these typed errors; `main` composes them
//! under `color_eyre::Result<()>`, matching the split the rest of this
//! codebase uses between `thiserror` at the component boundary and
//! `color-eyre` at the binary boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AasError {
    #[error("AAS request to {url} failed with status {status}")]
    Http { url: String, status: u16 },

    #[error("AAS transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to parse AAS response as JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("AAS path not found: {path}")]
    NotFound { path: String },

    #[error("AAS document had an unexpected structure: {reason}")]
    InvalidStructure { reason: String },

    #[error("ModelReference must begin with a submodel, not a shell: {path}")]
    ShellFirstReference { path: String },
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("command rejected: not valid in state {state}")]
    CommandRejected { state: &'static str },

    #[error("behavior tree build failed: {0}")]
    TreeBuild(String),

    #[error("discovery failed: {0}")]
    Discovery(#[from] AasError),

    #[error("mqtt transport error: {0}")]
    Transport(#[from] rumqttc::ClientError),
}

#[derive(Error, Debug)]
pub enum DistributorError {
    #[error("no handler registered for topic pattern {0}")]
    NoSuchTopic(String),

    #[error("instance already registered for topic {0}")]
    AlreadyRegistered(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("required port '{0}' was not set")]
    MissingPort(&'static str),

    #[error("station reply did not validate against the expected schema on topic {0}")]
    SchemaValidation(String),
}
