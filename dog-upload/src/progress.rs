//! Weighted progress tree.
//!
//! Every node owns a number of units. A node's fraction is its directly
//! completed units plus each child's fraction scaled by the units that child
//! stands for, divided by the node's total. The root publishes its fraction
//! on a [`watch`] channel whenever anything below it changes.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

struct Node {
    total_units: u64,
    state: Mutex<NodeState>,
    parent: Option<Weak<Node>>,
    publisher: Option<watch::Sender<f64>>,
}

#[derive(Default)]
struct NodeState {
    completed: u64,
    children: Vec<(Arc<Node>, u64)>,
    finished: bool,
}

impl Node {
    fn fraction(&self) -> f64 {
        let (completed, children) = {
            let state = self.state.lock();
            if state.finished {
                return 1.0;
            }
            (state.completed, state.children.clone())
        };
        if self.total_units == 0 {
            return 1.0;
        }

        let from_children: f64 = children
            .iter()
            .map(|(child, weight)| child.fraction() * *weight as f64)
            .sum();

        ((completed as f64 + from_children) / self.total_units as f64).clamp(0.0, 1.0)
    }

    /// Returns false if the node was already finished
    fn finish_subtree(&self) -> bool {
        let children = {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            state.finished = true;
            state.completed = self.total_units;
            state.children.clone()
        };
        for (child, _) in children {
            child.finish_subtree();
        }
        true
    }

    fn root(self: &Arc<Self>) -> Arc<Node> {
        let mut node = self.clone();
        while let Some(parent) = node.parent.as_ref().and_then(Weak::upgrade) {
            node = parent;
        }
        node
    }
}

/// Handle to one node of a progress tree
#[derive(Clone)]
pub struct ProgressTracker {
    node: Arc<Node>,
}

impl ProgressTracker {
    /// Create a root node with `total_units` units of work
    pub fn root(total_units: u64) -> Self {
        let (publisher, _) = watch::channel(0.0);
        let tracker = Self {
            node: Arc::new(Node {
                total_units,
                state: Mutex::new(NodeState::default()),
                parent: None,
                publisher: Some(publisher),
            }),
        };
        tracker.publish();
        tracker
    }

    /// Attach a child standing for `weight` of this node's units and
    /// tracking `total_units` units of its own
    pub fn child(&self, weight: u64, total_units: u64) -> ProgressTracker {
        let child = Arc::new(Node {
            total_units,
            state: Mutex::new(NodeState::default()),
            parent: Some(Arc::downgrade(&self.node)),
            publisher: None,
        });
        self.node.state.lock().children.push((child.clone(), weight));
        let tracker = ProgressTracker { node: child };
        tracker.publish();
        tracker
    }

    /// A single unit of work worth one unit of this node
    pub fn unit(&self) -> ProgressUnit {
        ProgressUnit {
            tracker: self.child(1, 1),
        }
    }

    pub fn total_units(&self) -> u64 {
        self.node.total_units
    }

    /// Mark `units` of this node's own work done
    pub fn complete_units(&self, units: u64) {
        if units == 0 {
            return;
        }
        {
            let mut state = self.node.state.lock();
            if state.finished {
                return;
            }
            state.completed = (state.completed + units).min(self.node.total_units);
        }
        self.publish();
    }

    /// Complete every outstanding unit of this node and its subtree.
    ///
    /// Idempotent. Used both on success and on cancellation so observers
    /// waiting for 1.0 always get there.
    pub fn complete_all(&self) {
        if self.node.finish_subtree() {
            self.publish();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.node.state.lock().finished
    }

    /// Current fraction of this node, in `[0.0, 1.0]`
    pub fn fraction(&self) -> f64 {
        self.node.fraction()
    }

    /// Watch the fraction of the whole tree
    pub fn subscribe(&self) -> watch::Receiver<f64> {
        match &self.node.root().publisher {
            Some(publisher) => publisher.subscribe(),
            // Only roots are built without a parent, and every root publishes
            None => watch::channel(1.0).1,
        }
    }

    /// Stream of tree-wide fractions
    pub fn stream(&self) -> WatchStream<f64> {
        WatchStream::new(self.subscribe())
    }

    fn publish(&self) {
        let root = self.node.root();
        if let Some(publisher) = &root.publisher {
            let value = root.fraction();
            publisher.send_if_modified(|current| {
                // Never move backwards, even if a late child is attached
                if value > *current {
                    *current = value;
                    true
                } else {
                    false
                }
            });
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total_units", &self.node.total_units)
            .field("fraction", &self.fraction())
            .finish()
    }
}

/// Leaf owning exactly one unit of work
#[derive(Clone, Debug)]
pub struct ProgressUnit {
    tracker: ProgressTracker,
}

impl ProgressUnit {
    /// Mark the unit done; repeat calls are no-ops
    pub fn complete(&self) {
        self.tracker.complete_all();
    }

    pub fn is_complete(&self) -> bool {
        self.tracker.is_finished()
    }
}
