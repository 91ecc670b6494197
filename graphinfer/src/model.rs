//! Serialized model surface. The core consumes a parsed, validated graph;
//! this loader handles the JSON carrier format and maps malformed input to
//! the invalid-model error kind.

use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::graph::Graph;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub producer_name: String,
    #[serde(default)]
    pub model_version: i64,
    #[serde(default)]
    pub doc_string: String,
    pub graph: Graph,
}

impl Model {
    pub fn new(graph: Graph) -> Self {
        Model {
            producer_name: String::new(),
            model_version: 0,
            doc_string: String::new(),
            graph,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| EngineError::invalid_model(format!("model parsing failed: {}", err)))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|err| EngineError::invalid_model(format!("model parsing failed: {}", err)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path.as_ref()).map_err(|err| {
            EngineError::invalid_model(format!(
                "cannot read model {}: {}",
                path.as_ref().display(),
                err
            ))
        })?;
        Self::from_bytes(&data)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
