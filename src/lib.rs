//! Durable workflow execution: declarative step trees, resumable positions,
//! and snapshot-backed persistence.
//!
//! A flow is described once as a tree of steps ([`step`]) via a fluent
//! builder ([`builder`]), then executed any number of times by a
//! [`FlowExecutor`](executor::FlowExecutor). External effects go through a
//! host-implemented [`RequestBus`](bus::RequestBus); everything the engine
//! needs to survive a restart lives behind a
//! [`SnapshotStore`](store::SnapshotStore). A flow that reaches a fork-join
//! suspends into the store and is picked back up by `resume` or an external
//! `signal`, continuing from its stored [`position`] without repeating
//! completed work.
//!
//! ```ignore
//! use flowstitch::flow::FlowConfig;
//!
//! let flow = FlowConfig::builder("greeter")
//!     .mutate(|s: &mut Greeting| s.attempts += 1)
//!     .send_into(
//!         |s| FlowRequest::new("greet", json!({ "name": s.name })),
//!         |s, response| s.reply = response.to_string(),
//!     )
//!     .build()?;
//! let executor = FlowExecutor::new(flow, bus, store);
//! let result = executor.run("greeting-42", Greeting::default()).await?;
//! ```

pub mod builder;
pub mod bus;
pub mod executor;
pub mod flow;
pub mod governors;
pub mod position;
pub mod progress;
pub mod snapshot;
pub mod step;
pub mod store;
pub mod telemetry;
pub mod wait;

pub use builder::{BuildError, FlowBuilder};
pub use bus::{BusError, FlowRequest, RequestBus};
pub use executor::{FlowError, FlowExecutor, FlowResult};
pub use flow::FlowConfig;
pub use governors::Governors;
pub use position::FlowPosition;
pub use snapshot::{FlowSnapshot, FlowStatus};
pub use store::{InMemorySnapshotStore, SnapshotStore};
pub use wait::{BranchSignal, WaitKind};
