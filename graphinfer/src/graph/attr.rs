use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

use super::graph::Graph;

/// Typed attribute value. Graph-valued attributes own their nested graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Int(i64),
    Ints(Vec<i64>),
    Float(f32),
    Floats(Vec<f32>),
    Str(String),
    Strs(Vec<String>),
    Tensor(Tensor),
    Graph(Graph),
}

/// Attribute bag attached to a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attributes {
    items: BTreeMap<String, AttrValue>,
}

impl Attributes {
    pub fn none() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    pub fn with(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.items.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: AttrValue) {
        self.items.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.items.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.items.iter()
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.items.get(name) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_ints(&self, name: &str) -> Option<&[i64]> {
        match self.items.get(name) {
            Some(AttrValue::Ints(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f32> {
        match self.items.get(name) {
            Some(AttrValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_floats(&self, name: &str) -> Option<&[f32]> {
        match self.items.get(name) {
            Some(AttrValue::Floats(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.items.get(name) {
            Some(AttrValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_tensor(&self, name: &str) -> Option<&Tensor> {
        match self.items.get(name) {
            Some(AttrValue::Tensor(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_graph(&self, name: &str) -> Option<&Graph> {
        match self.items.get(name) {
            Some(AttrValue::Graph(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_graph_mut(&mut self, name: &str) -> Option<&mut Graph> {
        match self.items.get_mut(name) {
            Some(AttrValue::Graph(v)) => Some(v),
            _ => None,
        }
    }

    /// Names of all graph-valued attributes.
    pub fn graph_attr_names(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|(_, value)| matches!(value, AttrValue::Graph(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
