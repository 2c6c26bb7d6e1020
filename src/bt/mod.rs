//! Behavior-tree node runtime.
//!
//! The BT engine's own grammar/scheduler is treated as an external library
//! with well-known tick/halt semantics; what lives here is the minimal
//! tree assembly needed to turn a fetched XML document into ticking
//! nodes, plus the standard node library grounded on
//! `original_source/BT_Controller/include/bt/*`.
//!
//! ```text
//! bt/
//! ├── blackboard.rs  - shared run state (equipment map, station table, ports)
//! ├── schema.rs      - lightweight structural predicate ("JSON schema as predicate")
//! ├── tree.rs        - NodeStatus, the Node trait, tree ticking
//! ├── xml.rs         - minimal XML tree loader
//! └── nodes/         - the standard node library
//! ```

pub mod blackboard;
pub mod nodes;
pub mod schema;
pub mod tree;
pub mod xml;

pub use tree::{Node, NodeStatus};
