pub mod edge;
pub mod goal;
pub mod node;
pub mod spec;

pub use edge::{EdgeCondition, EdgeSpec};
pub use goal::{Constraint, ConstraintKind, Goal, SuccessCriterion};
pub use node::{NodeKind, NodeSpec, RetryPolicy};
pub use spec::{Graph, GraphSpec};
