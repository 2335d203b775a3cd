// src/graph/mod.rs

//! Flow graph representation.
//!
//! - [`model`] holds the typed node/edge/object structs and the validated
//!   [`FlowGraph`].
//! - [`validate`] enforces topology invariants (single entry, acyclic,
//!   branching rules) using `petgraph`.
//! - [`loader`] reads flow definitions from TOML or JSON files.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{FlowDefinition, load_flow_definition};
pub use model::{Edge, FlowGraph, FlowObject, Node, RawFlowGraph, StepTask};
pub use validate::validate_graph;
