//! A validated flow definition: named step tree plus execution limits.

use crate::builder::FlowBuilder;
use crate::governors::Governors;
use crate::position::{FlowPosition, PositionError};
use crate::step::{self, Step};

/// An immutable flow definition produced by [`FlowBuilder::build`].
///
/// One `FlowConfig` serves any number of flow instances; per-instance state
/// lives in snapshots, never here.
pub struct FlowConfig<S> {
    name: String,
    steps: Vec<Step<S>>,
    governors: Governors,
}

impl<S> FlowConfig<S> {
    pub(crate) fn new(name: String, steps: Vec<Step<S>>, governors: Governors) -> Self {
        Self {
            name,
            steps,
            governors,
        }
    }

    /// Starts a builder for a flow with the given name.
    pub fn builder(name: impl Into<String>) -> FlowBuilder<S> {
        FlowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step<S>] {
        &self.steps
    }

    pub fn governors(&self) -> Governors {
        self.governors
    }

    /// Resolves a position against this flow's tree, returning the kind
    /// names of the steps along the path. Useful for diagnostics and for
    /// validating a restored resume cursor before interpreting it.
    pub fn resolve(&self, position: &FlowPosition) -> Result<Vec<&'static str>, PositionError> {
        step::resolve_path(&self.steps, position)
    }
}

impl<S> std::fmt::Debug for FlowConfig<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowConfig")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("governors", &self.governors)
            .finish()
    }
}
