//! Rule-based graph rewriting: semantics-preserving fusions and
//! eliminations applied until a fixed point or the configured step cap.

mod constant_fold;
mod conv_add;
mod conv_bn;
mod conv_mul;
mod identity;
mod slice;
mod unsqueeze;

use anyhow::Result;

use crate::graph::{Graph, OpKind};

pub use constant_fold::ConstantFolding;
pub use conv_add::ConvAddFusion;
pub use conv_bn::ConvBnFusion;
pub use conv_mul::ConvMulFusion;
pub use identity::EliminateIdentity;
pub use slice::EliminateSlice;
pub use unsqueeze::UnsqueezeElimination;

/// (op type, since-version) pair a rule opts into; the domain is implied by
/// the op. Nodes that do not match any target are skipped silently.
#[derive(Debug, Clone, Copy)]
pub struct OpTarget {
    pub op: OpKind,
    pub since_version: u32,
}

impl OpTarget {
    pub const fn new(op: OpKind, since_version: u32) -> Self {
        OpTarget { op, since_version }
    }
}

/// A predicate-plus-action pair over a single node.
///
/// `apply` must be transactional: either the rule fully applies or it leaves
/// the graph untouched, because a failing rule aborts the whole pipeline
/// with the graph in whatever state the rule produced.
pub trait RewriteRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ops this rule opts into; None matches every node.
    fn targets(&self) -> Option<&'static [OpTarget]>;

    fn satisfied(&self, graph: &Graph, node: usize) -> Result<bool>;

    fn apply(&self, graph: &mut Graph, node: usize, modified: &mut bool) -> Result<()>;
}

/// A whole-graph transformation step.
pub trait GraphTransformer: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, graph: &mut Graph, modified: &mut bool) -> Result<()>;
}

/// Applies registered rules to every live node in topological order.
pub struct RuleBasedPass {
    name: String,
    rules: Vec<Box<dyn RewriteRule>>,
}

impl RuleBasedPass {
    pub fn new(name: impl Into<String>) -> Self {
        RuleBasedPass {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    pub fn register(&mut self, rule: Box<dyn RewriteRule>) {
        self.rules.push(rule);
    }
}

impl GraphTransformer for RuleBasedPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, graph: &mut Graph, modified: &mut bool) -> Result<()> {
        let order = graph.topo_order()?.to_vec();
        for index in order {
            for rule in &self.rules {
                // A previous rule may have removed the node.
                let Some(node) = graph.try_node(index) else { break };
                let matches = match rule.targets() {
                    Some(targets) => targets
                        .iter()
                        .any(|target| node.is_op_version(target.op, target.since_version)),
                    None => true,
                };
                if !matches {
                    continue;
                }
                let node_name = node.name.clone();
                if !rule.satisfied(graph, index)? {
                    continue;
                }
                crate::trace!("rewrite rule {} fires on node {}", rule.name(), node_name);
                rule.apply(graph, index, modified)?;
            }
        }
        Ok(())
    }
}

/// Ordered collection of transformers driven to a fixed point.
pub struct TransformerManager {
    transformers: Vec<Box<dyn GraphTransformer>>,
    steps: usize,
}

impl TransformerManager {
    pub fn new(steps: usize) -> Self {
        TransformerManager {
            transformers: Vec::new(),
            steps: steps.max(1),
        }
    }

    /// Manager with the built-in rule set registered when
    /// `enable_default_transformers` is set. Unsqueeze elimination runs
    /// before the Conv fusions so per-channel factors look
    /// scalar-broadcast-compatible; BatchNormalization fuses before Mul/Add
    /// because it always produces a fresh weight and bias for them to fold
    /// into.
    pub fn with_defaults(steps: usize, enable_default_transformers: bool) -> Self {
        let mut manager = Self::new(steps);
        if enable_default_transformers {
            let mut pass = RuleBasedPass::new("default_rule_transformer");
            pass.register(Box::new(UnsqueezeElimination));
            pass.register(Box::new(ConstantFolding));
            pass.register(Box::new(EliminateIdentity));
            pass.register(Box::new(EliminateSlice));
            pass.register(Box::new(ConvBnFusion));
            pass.register(Box::new(ConvMulFusion));
            pass.register(Box::new(ConvAddFusion));
            manager.register(Box::new(pass));
        }
        manager
    }

    pub fn register(&mut self, transformer: Box<dyn GraphTransformer>) {
        self.transformers.push(transformer);
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    /// Run every transformer repeatedly until none reports a modification or
    /// the step cap is reached. The graph is re-resolved after each
    /// modifying transformer so no rule observes stale indices.
    pub fn apply_all(&self, graph: &mut Graph) -> Result<()> {
        if !graph.is_resolved() {
            graph.resolve()?;
        }
        for step in 0..self.steps {
            let mut changed = false;
            for transformer in &self.transformers {
                let mut modified = false;
                transformer.apply(graph, &mut modified)?;
                if modified {
                    graph.resolve()?;
                    changed = true;
                }
            }
            if !changed {
                crate::trace!("graph transforms reached a fixed point after {} steps", step);
                break;
            }
        }
        Ok(())
    }
}
