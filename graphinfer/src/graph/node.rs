use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tensor::ProviderId;

use super::attr::Attributes;

/// Operator domain. Standard ops live in the default domain; contributed ops
/// in the contrib domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Default,
    Contrib,
}

impl Domain {
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Default => "",
            Domain::Contrib => "contrib",
        }
    }
}

/// The closed operator set understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Abs,
    Add,
    BatchNormalization,
    ConstantFill,
    Conv,
    Div,
    EyeLike,
    Gemm,
    Identity,
    If,
    Max,
    Mul,
    Relu,
    ReverseSequence,
    Slice,
    Sub,
    Unsqueeze,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Abs => "Abs",
            OpKind::Add => "Add",
            OpKind::BatchNormalization => "BatchNormalization",
            OpKind::ConstantFill => "ConstantFill",
            OpKind::Conv => "Conv",
            OpKind::Div => "Div",
            OpKind::EyeLike => "EyeLike",
            OpKind::Gemm => "Gemm",
            OpKind::Identity => "Identity",
            OpKind::If => "If",
            OpKind::Max => "Max",
            OpKind::Mul => "Mul",
            OpKind::Relu => "Relu",
            OpKind::ReverseSequence => "ReverseSequence",
            OpKind::Slice => "Slice",
            OpKind::Sub => "Sub",
            OpKind::Unsqueeze => "Unsqueeze",
        }
    }

    pub fn domain(self) -> Domain {
        match self {
            OpKind::ReverseSequence | OpKind::ConstantFill => Domain::Contrib,
            _ => Domain::Default,
        }
    }

    /// Operator-set version this runtime implements for the op.
    pub fn since_version(self) -> u32 {
        match self {
            OpKind::Abs | OpKind::Relu => 6,
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => 7,
            OpKind::BatchNormalization | OpKind::Gemm => 7,
            OpKind::Max => 8,
            OpKind::EyeLike => 9,
            OpKind::Conv
            | OpKind::ConstantFill
            | OpKind::Identity
            | OpKind::If
            | OpKind::ReverseSequence
            | OpKind::Slice
            | OpKind::Unsqueeze => 1,
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OpKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "Abs" => Ok(OpKind::Abs),
            "Add" => Ok(OpKind::Add),
            "BatchNormalization" => Ok(OpKind::BatchNormalization),
            "ConstantFill" => Ok(OpKind::ConstantFill),
            "Conv" => Ok(OpKind::Conv),
            "Div" => Ok(OpKind::Div),
            "EyeLike" => Ok(OpKind::EyeLike),
            "Gemm" => Ok(OpKind::Gemm),
            "Identity" => Ok(OpKind::Identity),
            "If" => Ok(OpKind::If),
            "Max" => Ok(OpKind::Max),
            "Mul" => Ok(OpKind::Mul),
            "Relu" => Ok(OpKind::Relu),
            "ReverseSequence" => Ok(OpKind::ReverseSequence),
            "Slice" => Ok(OpKind::Slice),
            "Sub" => Ok(OpKind::Sub),
            "Unsqueeze" => Ok(OpKind::Unsqueeze),
            _ => Err(anyhow!("unsupported op {}", value)),
        }
    }
}

/// A single operation in the graph.
///
/// Inputs and outputs are value names; an empty input name marks an absent
/// optional input. The arena index is the node's stable identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub index: usize,
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub name: String,
    pub op: OpKind,
    #[serde(default)]
    pub since_version: u32,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attrs: Attributes,
    #[serde(skip)]
    pub provider: ProviderId,
}

impl Node {
    /// Input names with absent optional slots filtered out.
    pub fn present_inputs(&self) -> impl Iterator<Item = &String> {
        self.inputs.iter().filter(|name| !name.is_empty())
    }

    pub fn present_outputs(&self) -> impl Iterator<Item = &String> {
        self.outputs.iter().filter(|name| !name.is_empty())
    }

    /// Gate used by rewrite rules: op type, implemented version, and domain
    /// must all match for a rule to even consider the node.
    pub fn is_op_version(&self, op: OpKind, since_version: u32) -> bool {
        self.op == op && self.since_version == since_version && self.op.domain() == op.domain()
    }
}
