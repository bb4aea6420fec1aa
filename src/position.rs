//! Flow positions: index paths into an immutable step tree.
//!
//! A [`FlowPosition`] is the unit of resumability. It is a plain sequence of
//! integers, each selecting a child index at one nesting level of a
//! [`FlowConfig`](crate::flow::FlowConfig) step tree. Because the tree is
//! immutable and shared, a position is a value key rather than a live
//! reference, which is what makes cross-process and cross-restart resumption
//! possible.
//!
//! Positions are only meaningful against the flow configuration they were
//! captured from. Resolving a position against a different flow's tree is a
//! programming error and is treated as fatal by the executor.
//!
//! # Examples
//!
//! ```
//! use flowstitch::position::FlowPosition;
//!
//! let mut pos = FlowPosition::root();
//! assert!(pos.is_root());
//!
//! pos.push(0);
//! pos.push(2);
//! assert_eq!(pos.path(), &[0, 2]);
//! assert_eq!(pos.to_string(), "0.2");
//!
//! let child = pos.append(1);
//! assert_eq!(child.path(), &[0, 2, 1]);
//! assert_eq!(pos.path(), &[0, 2]);
//! ```

use std::fmt;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An ordered path of child indices identifying one node of a step tree.
///
/// The empty path is the root (the flow's top-level step sequence). Each
/// component selects a child at one nesting level; the meaning of a component
/// depends on the step kind at that level (sequence index, branch arm,
/// loop iteration, try region, or join branch).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowPosition {
    path: Vec<usize>,
}

impl FlowPosition {
    /// The root position: an empty path addressing the top-level sequence.
    #[must_use]
    pub fn root() -> Self {
        Self { path: Vec::new() }
    }

    /// Builds a position from an explicit path.
    #[must_use]
    pub fn from_path(path: Vec<usize>) -> Self {
        Self { path }
    }

    /// Returns a new position extended by one component, leaving `self`
    /// untouched.
    #[must_use]
    pub fn append(&self, index: usize) -> Self {
        let mut path = self.path.clone();
        path.push(index);
        Self { path }
    }

    /// Pushes a component in place. Used by the interpreter while descending.
    pub fn push(&mut self, index: usize) {
        self.path.push(index);
    }

    /// Pops the last component in place. Used by the interpreter while
    /// unwinding.
    pub fn pop(&mut self) -> Option<usize> {
        self.path.pop()
    }

    /// The raw component path.
    #[must_use]
    pub fn path(&self) -> &[usize] {
        &self.path
    }

    /// Number of components (nesting levels below the root).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Whether this is the root position.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

impl fmt::Display for FlowPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            return f.write_str("<root>");
        }
        let mut first = true;
        for component in &self.path {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{component}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<Vec<usize>> for FlowPosition {
    fn from(path: Vec<usize>) -> Self {
        Self { path }
    }
}

/// Errors produced when resolving a position against a step tree.
///
/// These indicate a position captured from a *different* tree (or corrupted
/// storage) and are not recoverable at runtime.
#[derive(Debug, Error, Diagnostic)]
pub enum PositionError {
    #[error("position component {index} out of bounds ({len} children) at {at}")]
    #[diagnostic(
        code(flowstitch::position::out_of_bounds),
        help("Positions resolve only against the flow configuration they were captured from.")
    )]
    OutOfBounds {
        index: usize,
        len: usize,
        at: String,
    },

    #[error("position descends into non-composite step `{kind}` at {at}")]
    #[diagnostic(
        code(flowstitch::position::not_composite),
        help("Leaf steps (send, mutate, for-each, break-if, continue-if) have no addressable children.")
    )]
    NotComposite { kind: &'static str, at: String },
}
