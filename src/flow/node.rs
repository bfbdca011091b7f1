//! Runtime nodes and the forward/backward traversal over them.
//!
//! A node activation may be launched once per incoming edge: the last
//! predecessor to complete re-triggers the successor. The predecessor check
//! plus the per-node lock with the post-lock completion test collapse those
//! activations to exactly one execution.

use super::call::Call;
use super::processes::Processes;
use super::tracker::Tracker;
use crate::Error;
use crate::flow::FlowError;
use crate::refs::Store;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A compiled node with dense-index edge lists.
#[derive(Clone)]
pub(crate) struct Node {
    pub name: String,
    pub previous: Vec<usize>,
    pub next: Vec<usize>,
    pub call: Option<Arc<dyn Call>>,
    pub rollback: Option<Arc<dyn Call>>,
}

/// Shared state of one forward execution.
pub(crate) struct ForwardPass {
    pub nodes: Arc<Vec<Node>>,
    pub tracker: Arc<Tracker>,
    pub processes: Arc<Processes>,
    pub store: Arc<Store>,
    pub token: CancellationToken,
}

/// Shared state of one rollback traversal. Consults the forward tracker so
/// only nodes that completed forward execute their rollback call.
pub(crate) struct BackwardPass {
    pub nodes: Arc<Vec<Node>>,
    pub tracker: Arc<Tracker>,
    pub forward: Arc<Tracker>,
    pub failures: Mutex<Vec<(String, Error)>>,
    pub processes: Arc<Processes>,
    pub store: Arc<Store>,
    pub token: CancellationToken,
}

/// Decrements the outstanding-activation counter on every exit path.
struct Done(Arc<Processes>);

impl Drop for Done {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Executes one node and fans out to its successors.
pub(crate) fn activate(pass: Arc<ForwardPass>, index: usize) -> BoxFuture<'static, ()> {
    async move {
        let _done = Done(pass.processes.clone());
        let node = &pass.nodes[index];

        if pass.processes.cancelled() {
            tracing::debug!(node = %node.name, "skipping activation, execution canceled");
            return;
        }

        if !pass.tracker.met_all(&node.previous) {
            tracing::debug!(node = %node.name, "has not met dependencies yet");
            return;
        }

        let guard = pass.tracker.lock(index).await;
        if pass.tracker.met(index) {
            tracing::debug!(node = %node.name, "node already executed");
            return;
        }

        // the execution may have been aborted while waiting for the lock
        if pass.processes.cancelled() {
            tracing::debug!(node = %node.name, "skipping activation, execution canceled");
            return;
        }

        if let Some(call) = &node.call {
            tracing::debug!(node = %node.name, "executing node call");

            if let Err(err) = call.execute(&pass.token, &pass.store).await {
                tracing::error!(node = %node.name, error = %err, "node call failed");
                pass.processes.fatal(Error::Flow(FlowError::NodeFailed {
                    node: node.name.clone(),
                    cause: Box::new(err),
                }));
                return;
            }
        }

        pass.tracker.mark(index);
        drop(guard);

        if pass.processes.faulted() || pass.processes.cancelled() {
            tracing::debug!(node = %node.name, "stopping fan-out, execution aborted");
            return;
        }

        pass.processes.add(node.next.len());
        for &next in &node.next {
            tokio::spawn(activate(pass.clone(), next));
        }
    }
    .boxed()
}

/// Rolls back one node and fans out to its predecessors. Errors are
/// collected but never abort the traversal.
pub(crate) fn revert(pass: Arc<BackwardPass>, index: usize) -> BoxFuture<'static, ()> {
    async move {
        let _done = Done(pass.processes.clone());
        let node = &pass.nodes[index];

        if !pass.tracker.met_all(&node.next) {
            tracing::debug!(node = %node.name, "successors not reverted yet");
            return;
        }

        {
            let guard = pass.tracker.lock(index).await;
            if !pass.tracker.met(index) {
                // nodes that never completed forward have nothing to compensate
                if pass.forward.met(index) {
                    if let Some(rollback) = &node.rollback {
                        tracing::debug!(node = %node.name, "executing node rollback");

                        if let Err(err) = rollback.execute(&pass.token, &pass.store).await {
                            tracing::error!(node = %node.name, error = %err, "node rollback failed");
                            lock_failures(&pass.failures).push((node.name.clone(), err));
                        }
                    }
                }

                pass.tracker.mark(index);
            }
            drop(guard);
        }

        pass.processes.add(node.previous.len());
        for &previous in &node.previous {
            tokio::spawn(revert(pass.clone(), previous));
        }
    }
    .boxed()
}

impl BackwardPass {
    /// Drains the collected rollback failures.
    pub fn take_failures(&self) -> Vec<(String, Error)> {
        std::mem::take(&mut *lock_failures(&self.failures))
    }
}

fn lock_failures(
    failures: &Mutex<Vec<(String, Error)>>,
) -> std::sync::MutexGuard<'_, Vec<(String, Error)>> {
    failures
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
