//! Safety governors: limits that forcibly fail runaway execution.
//!
//! Governors never block; they only measure. Exceeding any of them
//! terminates the run with `Failed` and an error message naming the tripped
//! limit ("depth", "iteration", or "timeout") so hosts can match on it.

use std::time::Duration;

/// Per-flow execution limits, overridable via
/// [`FlowBuilder::with_governors`](crate::builder::FlowBuilder::with_governors)
/// or the environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Governors {
    /// Maximum live nesting of loop/branch frames.
    pub max_depth: usize,
    /// Maximum cumulative loop iterations in one run (or one resume leg).
    pub max_iterations: u64,
    /// Wall-clock budget for one run/resume leg.
    pub timeout: Duration,
}

impl Default for Governors {
    fn default() -> Self {
        Self {
            max_depth: 1000,
            max_iterations: 10_000,
            timeout: Duration::from_secs(300),
        }
    }
}

impl Governors {
    /// Defaults overridden by `FLOWSTITCH_MAX_DEPTH`,
    /// `FLOWSTITCH_MAX_ITERATIONS`, and `FLOWSTITCH_TIMEOUT_SECS` where set.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            max_depth: env_parse("FLOWSTITCH_MAX_DEPTH").unwrap_or(defaults.max_depth),
            max_iterations: env_parse("FLOWSTITCH_MAX_ITERATIONS")
                .unwrap_or(defaults.max_iterations),
            timeout: env_parse("FLOWSTITCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let g = Governors::default();
        assert_eq!(g.max_depth, 1000);
        assert_eq!(g.max_iterations, 10_000);
        assert_eq!(g.timeout, Duration::from_secs(300));
    }

    #[test]
    fn builder_style_overrides() {
        let g = Governors::default()
            .with_max_depth(3)
            .with_max_iterations(50)
            .with_timeout(Duration::from_millis(10));
        assert_eq!(g.max_depth, 3);
        assert_eq!(g.max_iterations, 50);
        assert_eq!(g.timeout, Duration::from_millis(10));
    }
}
