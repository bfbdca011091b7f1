//! Flow compilation and the per-request execution entry point.

use super::call::Call;
use super::node::{BackwardPass, ForwardPass, Node, activate, revert};
use super::processes::Processes;
use super::tracker::Tracker;
use super::FlowError;
use crate::Error;
use crate::refs::Store;
use crate::specs::{FlowManager, dependencies};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The runtime calls attached to one node.
#[derive(Default)]
pub struct NodeCalls {
    pub call: Option<Arc<dyn Call>>,
    pub rollback: Option<Arc<dyn Call>>,
}

impl NodeCalls {
    pub fn new(call: Arc<dyn Call>) -> Self {
        Self {
            call: Some(call),
            rollback: None,
        }
    }

    pub fn with_rollback(mut self, rollback: Arc<dyn Call>) -> Self {
        self.rollback = Some(rollback);
        self
    }
}

/// An executable flow: a compiled DAG of runtime nodes sharing one `run`
/// entry point per request.
pub struct Manager {
    name: String,
    nodes: Arc<Vec<Node>>,
    starts: Vec<usize>,
    ends: Vec<usize>,
}

impl Manager {
    /// Compiles the given flow specification. Edges derive from explicit
    /// `depends_on` declarations unioned with reference-implied edges; the
    /// supplied call map attaches runtime behavior by node name.
    pub fn new(
        flow: &dyn FlowManager,
        mut calls: HashMap<String, NodeCalls>,
    ) -> Result<Self, Error> {
        let specs = flow.nodes();
        let index: HashMap<&str, usize> = specs
            .iter()
            .enumerate()
            .map(|(position, node)| (node.name.as_str(), position))
            .collect();

        let mut previous: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); specs.len()];
        let mut next: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); specs.len()];

        for (position, node) in specs.iter().enumerate() {
            for edge in dependencies::node_dependencies(flow, node)? {
                // node_dependencies only yields names present in the flow
                if let Some(&dependency) = index.get(edge.as_str()) {
                    previous[position].insert(dependency);
                    next[dependency].insert(position);
                }
            }
        }

        let nodes: Vec<Node> = specs
            .iter()
            .enumerate()
            .map(|(position, node)| {
                let attached = calls.remove(&node.name).unwrap_or_default();

                Node {
                    name: node.name.clone(),
                    previous: previous[position].iter().copied().collect(),
                    next: next[position].iter().copied().collect(),
                    call: attached.call,
                    rollback: attached.rollback,
                }
            })
            .collect();

        let starts = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.previous.is_empty())
            .map(|(position, _)| position)
            .collect();
        let ends = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.next.is_empty())
            .map(|(position, _)| position)
            .collect();

        Ok(Self {
            name: flow.name().to_string(),
            nodes: Arc::new(nodes),
            starts,
            ends,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executes the flow against the given store. Returns once every node
    /// has completed, the first fatal error has been recorded and rolled
    /// back, or the ambient context has been canceled.
    pub async fn run(&self, ctx: &CancellationToken, store: Arc<Store>) -> Result<(), Error> {
        tracing::debug!(flow = %self.name, "executing flow");

        if self.nodes.is_empty() {
            return Ok(());
        }

        let token = ctx.child_token();
        let processes = Arc::new(Processes::new(token.clone()));
        let tracker = Arc::new(Tracker::new(self.nodes.len()));

        let pass = Arc::new(ForwardPass {
            nodes: self.nodes.clone(),
            tracker: tracker.clone(),
            processes: processes.clone(),
            store: store.clone(),
            token,
        });

        processes.add(self.starts.len());
        for &start in &self.starts {
            tokio::spawn(activate(pass.clone(), start));
        }

        processes.wait().await;

        let Some(err) = processes.take() else {
            if ctx.is_cancelled() {
                return Err(FlowError::Canceled.into());
            }

            tracing::debug!(flow = %self.name, "flow completed");
            return Ok(());
        };

        tracing::error!(flow = %self.name, error = %err, "flow failed, reverting completed nodes");

        let mut failed = self.revert_completed(tracker, store).await;
        if failed.is_empty() {
            return Err(err);
        }

        failed.sort();
        Err(FlowError::RollbackFailed {
            cause: Box::new(err),
            nodes: failed,
        }
        .into())
    }

    /// Best-effort rollback traversal from the sink nodes toward the
    /// sources. Returns the names of nodes whose rollback call failed.
    async fn revert_completed(&self, forward: Arc<Tracker>, store: Arc<Store>) -> Vec<String> {
        // rollback runs under its own token: the request context is already
        // canceled at this point
        let token = CancellationToken::new();
        let processes = Arc::new(Processes::new(token.clone()));

        let pass = Arc::new(BackwardPass {
            nodes: self.nodes.clone(),
            tracker: Arc::new(Tracker::new(self.nodes.len())),
            forward,
            failures: Mutex::new(Vec::new()),
            processes: processes.clone(),
            store,
            token,
        });

        processes.add(self.ends.len());
        for &end in &self.ends {
            tokio::spawn(revert(pass.clone(), end));
        }

        processes.wait().await;

        pass.take_failures()
            .into_iter()
            .map(|(node, _)| node)
            .collect()
    }
}
