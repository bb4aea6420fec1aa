#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowstitch::bus::{BusError, FlowRequest, RequestBus};
use flowstitch::executor::FlowExecutor;
use flowstitch::flow::FlowConfig;
use flowstitch::store::InMemorySnapshotStore;

type Handler = Box<dyn Fn(&Value) -> Result<Value, BusError> + Send + Sync>;

/// Test bus: canned handlers per request kind plus a full dispatch log.
/// Kinds without a handler answer `null`.
#[derive(Default)]
pub struct RecordingBus {
    handlers: FxHashMap<String, Handler>,
    log: Mutex<Vec<FlowRequest>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        mut self,
        kind: &str,
        handler: impl Fn(&Value) -> Result<Value, BusError> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(kind.to_string(), Box::new(handler));
        self
    }

    /// A handler that rejects every request with the given failure kind.
    pub fn rejecting(self, kind: &str, failure_kind: &str) -> Self {
        let failure_kind = failure_kind.to_string();
        self.on(kind, move |_| {
            Err(BusError::rejected(failure_kind.clone(), "rejected by test bus"))
        })
    }

    pub fn requests(&self) -> Vec<FlowRequest> {
        self.log.lock().clone()
    }

    /// Number of dispatched requests of one kind.
    pub fn count(&self, kind: &str) -> usize {
        self.log.lock().iter().filter(|r| r.kind == kind).count()
    }
}

#[async_trait]
impl RequestBus for RecordingBus {
    async fn dispatch(&self, request: FlowRequest) -> Result<Value, BusError> {
        self.log.lock().push(request.clone());
        match self.handlers.get(&request.kind) {
            Some(handler) => handler(&request.payload),
            None => Ok(Value::Null),
        }
    }
}

/// Order-shaped state used across the executor tests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub total: f64,
    pub attempts: u32,
    pub counter: i64,
    pub processed: Vec<String>,
    pub failures: Vec<String>,
    pub notes: Vec<String>,
}

/// Wires a flow, a bus, and a fresh in-memory store into an executor,
/// handing back the bus and store for assertions.
pub fn harness<S>(
    flow: FlowConfig<S>,
    bus: RecordingBus,
) -> (FlowExecutor<S>, Arc<RecordingBus>, Arc<InMemorySnapshotStore>)
where
    S: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    let bus = Arc::new(bus);
    let store = Arc::new(InMemorySnapshotStore::new());
    let executor = FlowExecutor::new(flow, bus.clone(), store.clone());
    (executor, bus, store)
}
