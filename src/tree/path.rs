// src/tree/path.rs

//! Node references as typed by an operator: `web`, `web[1]`,
//! `web[0].worker`, `cluster.db[2]`.

use std::fmt;
use std::str::FromStr;

use crate::errors::{FanoutError, Result};
use crate::tree::isolate::Cell;
use crate::tree::node::{Isolation, NodeId, Tree};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    name: String,
    index: Option<usize>,
}

/// A parsed node path with optional cell indices.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodePath {
    segments: Vec<Segment>,
}

impl FromStr for NodePath {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut segments = Vec::new();
        if s.is_empty() || s == "." {
            return Ok(Self { segments });
        }

        for raw in s.split('.') {
            let bad = || FanoutError::UnknownNode(format!("malformed node path '{s}'"));
            let (name, index) = match raw.find('[') {
                None => (raw, None),
                Some(open) => {
                    let close = raw.strip_suffix(']').ok_or_else(bad)?;
                    let idx = close[open + 1..].parse::<usize>().map_err(|_| bad())?;
                    (&raw[..open], Some(idx))
                }
            };
            if name.is_empty() || name.contains(['[', ']']) {
                return Err(bad());
            }
            segments.push(Segment {
                name: name.to_string(),
                index,
            });
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&seg.name)?;
            if let Some(idx) = seg.index {
                write!(f, "[{idx}]")?;
            }
        }
        Ok(())
    }
}

/// A node plus a filter over its cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub node: NodeId,
    /// One slot per array node on the path; `None` selects every cell.
    pub filter: Vec<Option<usize>>,
}

impl NodeRef {
    pub fn whole(node: NodeId, tree: &Tree) -> Self {
        Self {
            node,
            filter: vec![None; tree.array_depth(node)],
        }
    }

    /// Every array level is pinned: the reference names one cell.
    pub fn is_single_cell(&self) -> bool {
        self.filter.iter().all(Option::is_some)
    }

    pub fn matches(&self, cell: &Cell) -> bool {
        let index = cell.index.as_slice();
        self.filter.len() == index.len()
            && self
                .filter
                .iter()
                .zip(index)
                .all(|(want, got)| want.is_none_or(|w| w == *got))
    }
}

impl NodePath {
    /// Resolve names against `tree`. Indexing a non-array node is an error.
    pub fn resolve(&self, tree: &Tree) -> Result<NodeRef> {
        let mut id = tree.root();
        let mut filter = Vec::new();

        if matches!(tree.node(id).isolation(), Isolation::Array { .. }) {
            filter.push(None);
        }

        for seg in &self.segments {
            id = tree
                .child(id, &seg.name)
                .ok_or_else(|| FanoutError::UnknownNode(self.to_string()))?;
            let is_array = matches!(tree.node(id).isolation(), Isolation::Array { .. });
            match (seg.index, is_array) {
                (Some(i), true) => filter.push(Some(i)),
                (None, true) => filter.push(None),
                (None, false) => {}
                (Some(i), false) => {
                    return Err(FanoutError::UnknownCell {
                        node: tree.node(id).display_name().to_string(),
                        index: format!("[{i}] (node is not an array)"),
                    });
                }
            }
        }
        Ok(NodeRef { node: id, filter })
    }
}
