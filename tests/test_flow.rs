use async_trait::async_trait;
use crossflow::flow::{Call, FlowError, Manager, NodeCalls};
use crossflow::specs::{self, ParameterMap, Property, Type};
use crossflow::{CancellationToken, Error, Flow, Node, Store, TransportError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ------------------------------------
// Recording call used across the tests
// ------------------------------------

#[derive(Default)]
struct RecordingCall {
    name: String,
    hits: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<String>>>,
    fail: bool,
    /// Written to the store after a successful run.
    writes: Option<(String, String, Value)>,
    /// Asserted present before anything else; missing values fail the call.
    reads: Option<(String, String)>,
    barrier: Option<Arc<tokio::sync::Barrier>>,
    wait_for_cancel: bool,
    delay: Option<Duration>,
}

impl RecordingCall {
    fn new(name: &str, order: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            order: order.clone(),
            ..Self::default()
        }
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn writing(mut self, resource: &str, path: &str, value: Value) -> Self {
        self.writes = Some((resource.to_string(), path.to_string(), value));
        self
    }

    fn reading(mut self, resource: &str, path: &str) -> Self {
        self.reads = Some((resource.to_string(), path.to_string()));
        self
    }

    fn synced(mut self, barrier: &Arc<tokio::sync::Barrier>) -> Self {
        self.barrier = Some(barrier.clone());
        self
    }

    fn waiting_for_cancel(mut self) -> Self {
        self.wait_for_cancel = true;
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Call for RecordingCall {
    async fn execute(&self, ctx: &CancellationToken, store: &Store) -> Result<(), Error> {
        self.hits.fetch_add(1, Ordering::SeqCst);

        if self.wait_for_cancel {
            ctx.cancelled().await;
            return Err(TransportError::Canceled.into());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }

        if let Some((resource, path)) = &self.reads {
            if store.load(resource, path).is_none() {
                return Err(TransportError::Unavailable(format!(
                    "missing {resource}:{path}"
                ))
                .into());
            }
        }

        if let Some((resource, path, value)) = &self.writes {
            store.store(resource, path, value.clone());
        }

        self.order
            .lock()
            .unwrap()
            .push(self.name.clone());

        if self.fail {
            return Err(TransportError::RemoteFault {
                status: 500,
                message: "boom".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

fn run_order() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

async fn run(manager: &Manager) -> Result<(), Error> {
    manager
        .run(&CancellationToken::new(), Arc::new(Store::new(8)))
        .await
}

// ------------------------------------
// 1. Diamond DAG: ordering, at-most-once
// ------------------------------------

#[tokio::test]
async fn test_diamond_executes_each_node_once_in_order() {
    let flow = Flow::new("diamond")
        .with_node(Node::new("a"))
        .with_node(Node::new("b").with_dependency("a"))
        .with_node(Node::new("c").with_dependency("a"))
        .with_node(Node::new("d").with_dependency("b").with_dependency("c"));

    let order = run_order();
    let mut calls = HashMap::new();
    let mut hits = HashMap::new();

    for name in ["a", "b", "c", "d"] {
        let call = RecordingCall::new(name, &order);
        hits.insert(name, call.hits.clone());
        calls.insert(name.to_string(), NodeCalls::new(Arc::new(call)));
    }

    let manager = Manager::new(&flow, calls).unwrap();
    run(&manager).await.unwrap();

    for name in ["a", "b", "c", "d"] {
        assert_eq!(hits[name].load(Ordering::SeqCst), 1, "node {name}");
    }

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], "a");
    assert_eq!(order[3], "d");
}

#[tokio::test]
async fn test_diamond_siblings_run_concurrently() {
    let flow = Flow::new("diamond")
        .with_node(Node::new("a"))
        .with_node(Node::new("b").with_dependency("a"))
        .with_node(Node::new("c").with_dependency("a"))
        .with_node(Node::new("d").with_dependency("b").with_dependency("c"));

    let order = run_order();
    // both siblings must be in flight at once for the barrier to release
    let barrier = Arc::new(tokio::sync::Barrier::new(2));

    let mut calls = HashMap::new();
    calls.insert(
        "a".to_string(),
        NodeCalls::new(Arc::new(RecordingCall::new("a", &order))),
    );
    calls.insert(
        "b".to_string(),
        NodeCalls::new(Arc::new(RecordingCall::new("b", &order).synced(&barrier))),
    );
    calls.insert(
        "c".to_string(),
        NodeCalls::new(Arc::new(RecordingCall::new("c", &order).synced(&barrier))),
    );
    calls.insert(
        "d".to_string(),
        NodeCalls::new(Arc::new(RecordingCall::new("d", &order))),
    );

    let manager = Manager::new(&flow, calls).unwrap();

    tokio::time::timeout(Duration::from_secs(5), run(&manager))
        .await
        .expect("siblings deadlocked, they were not scheduled concurrently")
        .unwrap();
}

// ------------------------------------
// 2. Happens-before across edges
// ------------------------------------

#[tokio::test]
async fn test_writes_are_visible_to_successors() {
    let flow = Flow::new("chained")
        .with_node(Node::new("first"))
        .with_node(Node::new("second").with_dependency("first"));

    let order = run_order();
    let mut calls = HashMap::new();
    calls.insert(
        "first".to_string(),
        NodeCalls::new(Arc::new(
            RecordingCall::new("first", &order).writing("first.response", "value", json!("v")),
        )),
    );
    calls.insert(
        "second".to_string(),
        NodeCalls::new(Arc::new(
            RecordingCall::new("second", &order)
                .delayed(Duration::from_millis(1))
                .reading("first.response", "value"),
        )),
    );

    let manager = Manager::new(&flow, calls).unwrap();
    run(&manager).await.unwrap();
}

#[tokio::test]
async fn test_reference_implies_edge() {
    // no explicit depends_on: the request reference alone must order the nodes
    let flow = Flow::new("implicit")
        .with_node(Node::new("first"))
        .with_node(
            Node::new("second").with_call(
                specs::Call::new("upstream", "get").with_request(ParameterMap::new(
                    Property::root(vec![
                        Property::scalar("value", Type::String)
                            .with_reference("first.response", "value"),
                    ]),
                )),
            ),
        );

    let order = run_order();
    let mut calls = HashMap::new();
    calls.insert(
        "first".to_string(),
        NodeCalls::new(Arc::new(
            RecordingCall::new("first", &order)
                .delayed(Duration::from_millis(5))
                .writing("first.response", "value", json!("v")),
        )),
    );
    calls.insert(
        "second".to_string(),
        NodeCalls::new(Arc::new(
            RecordingCall::new("second", &order).reading("first.response", "value"),
        )),
    );

    let manager = Manager::new(&flow, calls).unwrap();
    run(&manager).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

// ------------------------------------
// 3. Rollback
// ------------------------------------

#[tokio::test]
async fn test_rollback_compensates_completed_nodes_in_reverse() {
    let flow = Flow::new("chain")
        .with_node(Node::new("a"))
        .with_node(Node::new("b").with_dependency("a"))
        .with_node(Node::new("c").with_dependency("b"))
        .with_node(Node::new("d").with_dependency("c"));

    let order = run_order();
    let reverted = run_order();

    let mut calls = HashMap::new();
    let mut rollback_hits = HashMap::new();
    let mut forward_hits = HashMap::new();

    for name in ["a", "b", "c", "d"] {
        let forward = match name {
            "c" => RecordingCall::new(name, &order).failing(),
            _ => RecordingCall::new(name, &order),
        };
        let rollback = RecordingCall::new(name, &reverted);

        forward_hits.insert(name, forward.hits.clone());
        rollback_hits.insert(name, rollback.hits.clone());
        calls.insert(
            name.to_string(),
            NodeCalls::new(Arc::new(forward)).with_rollback(Arc::new(rollback)),
        );
    }

    let manager = Manager::new(&flow, calls).unwrap();
    let err = run(&manager).await.unwrap_err();

    match err {
        Error::Flow(FlowError::NodeFailed { node, .. }) => assert_eq!(node, "c"),
        other => panic!("unexpected error {other}"),
    }

    // d was never reached forward and never compensated
    assert_eq!(forward_hits["d"].load(Ordering::SeqCst), 0);
    assert_eq!(rollback_hits["d"].load(Ordering::SeqCst), 0);
    // the failing node itself is not compensated
    assert_eq!(rollback_hits["c"].load(Ordering::SeqCst), 0);

    assert_eq!(*reverted.lock().unwrap(), vec!["b", "a"]);
}

#[tokio::test]
async fn test_rollback_failures_are_aggregated_not_masking() {
    let flow = Flow::new("chain")
        .with_node(Node::new("a"))
        .with_node(Node::new("b").with_dependency("a"))
        .with_node(Node::new("c").with_dependency("b"));

    let order = run_order();
    let reverted = run_order();

    let mut calls = HashMap::new();
    calls.insert(
        "a".to_string(),
        NodeCalls::new(Arc::new(RecordingCall::new("a", &order)))
            .with_rollback(Arc::new(RecordingCall::new("a", &reverted))),
    );
    calls.insert(
        "b".to_string(),
        NodeCalls::new(Arc::new(RecordingCall::new("b", &order)))
            .with_rollback(Arc::new(RecordingCall::new("b", &reverted).failing())),
    );
    calls.insert(
        "c".to_string(),
        NodeCalls::new(Arc::new(RecordingCall::new("c", &order).failing())),
    );

    let manager = Manager::new(&flow, calls).unwrap();
    let err = run(&manager).await.unwrap_err();

    match err {
        Error::Flow(FlowError::RollbackFailed { cause, nodes }) => {
            assert_eq!(nodes, vec!["b".to_string()]);
            match *cause {
                Error::Flow(FlowError::NodeFailed { node, .. }) => assert_eq!(node, "c"),
                other => panic!("rollback masked the forward error: {other}"),
            }
        }
        other => panic!("unexpected error {other}"),
    }

    // best effort continued past the failing rollback
    assert_eq!(*reverted.lock().unwrap(), vec!["b", "a"]);
}

// ------------------------------------
// 4. Cancellation
// ------------------------------------

#[tokio::test]
async fn test_cancellation_aborts_cooperating_calls() {
    let flow = Flow::new("canceled")
        .with_node(Node::new("a"))
        .with_node(Node::new("b").with_dependency("a"));

    let order = run_order();
    let a = RecordingCall::new("a", &order).waiting_for_cancel();
    let b = RecordingCall::new("b", &order);
    let b_hits = b.hits.clone();

    let mut calls = HashMap::new();
    calls.insert("a".to_string(), NodeCalls::new(Arc::new(a)));
    calls.insert("b".to_string(), NodeCalls::new(Arc::new(b)));

    let manager = Arc::new(Manager::new(&flow, calls).unwrap());
    let token = CancellationToken::new();

    let ambient = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ambient.cancel();
    });

    let err = manager
        .run(&token, Arc::new(Store::new(8)))
        .await
        .unwrap_err();

    match err {
        Error::Flow(FlowError::NodeFailed { node, cause }) => {
            assert_eq!(node, "a");
            assert!(matches!(
                *cause,
                Error::Transport(TransportError::Canceled)
            ));
        }
        other => panic!("unexpected error {other}"),
    }

    assert_eq!(b_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_stops_further_activations() {
    let flow = Flow::new("canceled")
        .with_node(Node::new("a"))
        .with_node(Node::new("b").with_dependency("a"));

    // a ignores the token and completes after the cancellation below
    let order = run_order();
    let a = RecordingCall::new("a", &order).delayed(Duration::from_millis(50));
    let b = RecordingCall::new("b", &order);
    let b_hits = b.hits.clone();

    let mut calls = HashMap::new();
    calls.insert("a".to_string(), NodeCalls::new(Arc::new(a)));
    calls.insert("b".to_string(), NodeCalls::new(Arc::new(b)));

    let manager = Manager::new(&flow, calls).unwrap();
    let token = CancellationToken::new();

    let ambient = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        ambient.cancel();
    });

    let err = manager
        .run(&token, Arc::new(Store::new(8)))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Flow(FlowError::Canceled)));
    assert_eq!(b_hits.load(Ordering::SeqCst), 0);
}

// ------------------------------------
// 5. Edge cases
// ------------------------------------

#[tokio::test]
async fn test_empty_flow_completes() {
    let manager = Manager::new(&Flow::new("empty"), HashMap::new()).unwrap();
    run(&manager).await.unwrap();
}

#[tokio::test]
async fn test_nodes_without_calls_still_schedule() {
    let flow = Flow::new("wired")
        .with_node(Node::new("first"))
        .with_node(Node::new("second").with_dependency("first"));

    let order = run_order();
    let mut calls = HashMap::new();
    calls.insert(
        "second".to_string(),
        NodeCalls::new(Arc::new(RecordingCall::new("second", &order))),
    );

    let manager = Manager::new(&flow, calls).unwrap();
    run(&manager).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["second"]);
}
