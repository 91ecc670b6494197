mod attr;
mod node;
#[allow(clippy::module_inception)]
mod graph;
pub(crate) mod shape;

pub use attr::{AttrValue, Attributes};
pub use graph::{Graph, ValueInfo};
pub use node::{Domain, Node, OpKind};
