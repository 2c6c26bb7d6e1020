//! `NodeStatus`, the `Node` trait every tree node implements, and the two
//! generic control nodes (`Sequence`, `Fallback`) needed to structure a
//! tree around the specialised nodes in `nodes/`. The BT engine's full
//! grammar is out of scope; these two control nodes carry only the
//! resumable-index behaviour every BT engine implements for `RUNNING`
//! children, so the minimal XML loader in `xml.rs` has something to build
//! ordinary structure out of.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Idle,
    Running,
    Success,
    Failure,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Failure)
    }
}

#[async_trait]
pub trait Node: Send + Sync {
    async fn tick(&self) -> NodeStatus;

    /// Called when a parent halts this subtree (external Stop/Suspend, or a
    /// sibling in a control node taking over). Default: nothing to clean
    /// up, for nodes with no outstanding MQTT request.
    async fn halt(&self) {}

    /// Resolve every logical MQTT topic this node (or any node in its
    /// subtree) needs against the interface cache, before the tree is
    /// armed with the distributor. Default: nothing to resolve. MQTT-facing
    /// leaves override this to populate their topic cache; every control
    /// node and decorator overrides it to recurse into its children, so one
    /// call on the tree root reaches every leaf before the first tick
    /// (SPEC_FULL §4.1 step 6 / §5's retained-message ordering guarantee).
    async fn prime(&self) {}
}

/// Ticks children in order; `RUNNING` pauses on the current child and
/// resumes there next tick; any `FAILURE` short-circuits to `FAILURE`; all
/// children `SUCCESS` resets and returns `SUCCESS`.
pub struct Sequence {
    children: Vec<Arc<dyn Node>>,
    current: AtomicUsize,
}

impl Sequence {
    pub fn new(children: Vec<Arc<dyn Node>>) -> Self {
        Self {
            children,
            current: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Node for Sequence {
    async fn tick(&self) -> NodeStatus {
        let mut idx = self.current.load(Ordering::SeqCst);
        while idx < self.children.len() {
            match self.children[idx].tick().await {
                NodeStatus::Running => {
                    self.current.store(idx, Ordering::SeqCst);
                    return NodeStatus::Running;
                }
                NodeStatus::Failure => {
                    self.current.store(0, Ordering::SeqCst);
                    return NodeStatus::Failure;
                }
                NodeStatus::Success | NodeStatus::Skipped | NodeStatus::Idle => {
                    idx += 1;
                }
            }
        }
        self.current.store(0, Ordering::SeqCst);
        NodeStatus::Success
    }

    async fn halt(&self) {
        for child in &self.children {
            child.halt().await;
        }
        self.current.store(0, Ordering::SeqCst);
    }

    async fn prime(&self) {
        for child in &self.children {
            child.prime().await;
        }
    }
}

/// Ticks children in order until one succeeds; `RUNNING` pauses and
/// resumes on the current child; all children `FAILURE` returns `FAILURE`.
pub struct Fallback {
    children: Vec<Arc<dyn Node>>,
    current: AtomicUsize,
}

impl Fallback {
    pub fn new(children: Vec<Arc<dyn Node>>) -> Self {
        Self {
            children,
            current: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Node for Fallback {
    async fn tick(&self) -> NodeStatus {
        let mut idx = self.current.load(Ordering::SeqCst);
        while idx < self.children.len() {
            match self.children[idx].tick().await {
                NodeStatus::Running => {
                    self.current.store(idx, Ordering::SeqCst);
                    return NodeStatus::Running;
                }
                NodeStatus::Success => {
                    self.current.store(0, Ordering::SeqCst);
                    return NodeStatus::Success;
                }
                NodeStatus::Failure | NodeStatus::Skipped | NodeStatus::Idle => {
                    idx += 1;
                }
            }
        }
        self.current.store(0, Ordering::SeqCst);
        NodeStatus::Failure
    }

    async fn halt(&self) {
        for child in &self.children {
            child.halt().await;
        }
        self.current.store(0, Ordering::SeqCst);
    }

    async fn prime(&self) {
        for child in &self.children {
            child.prime().await;
        }
    }
}

/// Owns the root of an armed tree and drives its tick loop. The controller
/// (`src/packml/controller.rs`) ticks it on a fixed interval while in
/// `EXECUTE`.
pub struct Tree {
    root: Arc<dyn Node>,
}

impl Tree {
    pub fn new(root: Arc<dyn Node>) -> Self {
        Self { root }
    }

    /// Resolves every MQTT-facing node's topics against the interface
    /// cache. Must be called once, after construction and before the
    /// distributor arms its subscriptions for this tree.
    pub async fn prime(&self) {
        self.root.prime().await;
    }

    pub async fn tick_once(&self) -> NodeStatus {
        self.root.tick().await
    }

    pub async fn halt(&self) {
        self.root.halt().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Fixed(NodeStatus);

    #[async_trait]
    impl Node for Fixed {
        async fn tick(&self) -> NodeStatus {
            self.0
        }
    }

    struct CountingRunningThenSuccess {
        calls: Mutex<usize>,
        succeed_after: usize,
    }

    #[async_trait]
    impl Node for CountingRunningThenSuccess {
        async fn tick(&self) -> NodeStatus {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls >= self.succeed_after {
                NodeStatus::Success
            } else {
                NodeStatus::Running
            }
        }
    }

    #[tokio::test]
    async fn sequence_short_circuits_on_failure() {
        let seq = Sequence::new(vec![
            Arc::new(Fixed(NodeStatus::Success)),
            Arc::new(Fixed(NodeStatus::Failure)),
            Arc::new(Fixed(NodeStatus::Success)),
        ]);
        assert_eq!(seq.tick().await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn sequence_resumes_running_child() {
        let running_child = Arc::new(CountingRunningThenSuccess {
            calls: Mutex::new(0),
            succeed_after: 2,
        });
        let seq = Sequence::new(vec![running_child.clone(), Arc::new(Fixed(NodeStatus::Success))]);
        assert_eq!(seq.tick().await, NodeStatus::Running);
        assert_eq!(seq.tick().await, NodeStatus::Success);
        assert_eq!(*running_child.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn fallback_returns_first_success() {
        let fb = Fallback::new(vec![
            Arc::new(Fixed(NodeStatus::Failure)),
            Arc::new(Fixed(NodeStatus::Success)),
        ]);
        assert_eq!(fb.tick().await, NodeStatus::Success);
    }

    #[tokio::test]
    async fn fallback_all_failure_is_failure() {
        let fb = Fallback::new(vec![Arc::new(Fixed(NodeStatus::Failure)), Arc::new(Fixed(NodeStatus::Failure))]);
        assert_eq!(fb.tick().await, NodeStatus::Failure);
    }
}
