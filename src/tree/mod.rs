// src/tree/mod.rs

//! The node tree and the two pure engines over it.
//!
//! - `node`: arena of plain data nodes, built and checked by `TreeBuilder`.
//! - `roles`: ordered role sets and role mappings.
//! - `resolve`: role resolution (`Resolver`).
//! - `isolate`: expansion of a node into independently executable cells.
//! - `path`: operator-facing node references (`web[1].app`).

pub mod isolate;
pub mod node;
pub mod path;
pub mod resolve;
pub mod roles;

pub use isolate::{Cell, CellIndex, expand_child, isolate};
pub use node::{HostsDecl, Isolation, NodeBuilder, NodeDecl, NodeId, Tree, TreeBuilder};
pub use path::{NodePath, NodeRef};
pub use resolve::{Resolver, derive_roles};
pub use roles::{MappingSource, RoleMapping, RoleSet};
