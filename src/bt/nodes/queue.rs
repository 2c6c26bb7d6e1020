//! Queue and gate decorators (§4.5.5): draining a shared product-ID queue
//! and gating execution by a sampling percentage.
//!
//! Grounded on `KeepRunningUntilEmpty`, `GetProductFromQueue`,
//! `PopElementNode`, `SamplingGate`, and `QualityControlGate`
//! (`original_source/BT_Controller/src/bt/decorators/keep_running_until_empty.cpp`,
//! `get_product_from_queue.cpp`, `include/bt/actions/pop_element_node.h`,
//! `src/bt/decorators/sampling_gate.cpp` and `quality_control_gate.cpp`).
//! The queue itself lives on [`Blackboard`] rather than a shared
//! `std::deque` pointer; `pop_queue_front`/`queue_len`/`batch_size` give
//! these nodes the same read-modify-write semantics under one lock.

use crate::bt::blackboard::Blackboard;
use crate::bt::nodes::context::NodeContext;
use crate::bt::tree::{Node, NodeStatus};
use crate::interface_cache::Direction;
use crate::mqtt::topic::TopicDescriptor;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Status returned when the monitored queue is (or becomes) empty.
/// Mirrors the three terminal `BT::NodeStatus` values the original exposes
/// through its `if_empty` port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmptyStatus {
    Success,
    Failure,
    Skipped,
}

impl From<EmptyStatus> for NodeStatus {
    fn from(value: EmptyStatus) -> Self {
        match value {
            EmptyStatus::Success => NodeStatus::Success,
            EmptyStatus::Failure => NodeStatus::Failure,
            EmptyStatus::Skipped => NodeStatus::Skipped,
        }
    }
}

/// Ticks its child every tick while `queue_key` is non-empty on the
/// blackboard; halts and resets the child and returns `if_empty` the tick
/// the queue is found empty.
pub struct KeepRunningUntilEmpty {
    blackboard: Arc<Blackboard>,
    queue_key: String,
    if_empty: EmptyStatus,
    child: Arc<dyn Node>,
}

impl KeepRunningUntilEmpty {
    pub fn new(
        blackboard: Arc<Blackboard>,
        queue_key: impl Into<String>,
        if_empty: EmptyStatus,
        child: Arc<dyn Node>,
    ) -> Self {
        Self {
            blackboard,
            queue_key: queue_key.into(),
            if_empty,
            child,
        }
    }
}

#[async_trait]
impl Node for KeepRunningUntilEmpty {
    async fn tick(&self) -> NodeStatus {
        if self.blackboard.queue_len(&self.queue_key) == 0 {
            self.child.halt().await;
            return self.if_empty.into();
        }

        match self.child.tick().await {
            NodeStatus::Success => {
                self.child.halt().await;
                NodeStatus::Running
            }
            NodeStatus::Failure => {
                self.child.halt().await;
                NodeStatus::Failure
            }
            NodeStatus::Running => NodeStatus::Running,
            NodeStatus::Skipped | NodeStatus::Idle => {
                self.child.halt().await;
                NodeStatus::Failure
            }
        }
    }

    async fn halt(&self) {
        self.child.halt().await;
    }

    async fn prime(&self) {
        self.child.prime().await;
    }
}

fn product_payload(product_id: &str) -> serde_json::Value {
    json!({ "ProductId": product_id, "TimeStamp": Utc::now().to_rfc3339() })
}

/// Synchronous pop-and-publish: takes the front of `queue_key`, publishes
/// it on the asset's `ProductID` interaction, and writes it to
/// `output_key`. No child; returns `if_empty` when the queue has nothing
/// left.
pub struct PopElementNode {
    ctx: Arc<NodeContext>,
    asset_port: String,
    queue_key: String,
    output_key: String,
    if_empty: EmptyStatus,
    topic: OnceCell<Option<TopicDescriptor>>,
}

impl PopElementNode {
    pub fn new(
        ctx: Arc<NodeContext>,
        asset_port: impl Into<String>,
        queue_key: impl Into<String>,
        output_key: impl Into<String>,
        if_empty: EmptyStatus,
    ) -> Self {
        Self {
            ctx,
            asset_port: asset_port.into(),
            queue_key: queue_key.into(),
            output_key: output_key.into(),
            if_empty,
            topic: OnceCell::new(),
        }
    }

    async fn topic(&self) -> Option<&TopicDescriptor> {
        self.topic
            .get_or_init(|| async {
                let asset_id = self.ctx.blackboard.get_str(&self.asset_port)?;
                self.ctx.resolve_topic(&asset_id, "productid", Direction::Input).await
            })
            .await
            .as_ref()
    }
}

#[async_trait]
impl Node for PopElementNode {
    async fn tick(&self) -> NodeStatus {
        let Some(product_id) = self.ctx.blackboard.pop_queue_front(&self.queue_key) else {
            return self.if_empty.into();
        };

        self.ctx.blackboard.set(&self.output_key, product_id.clone());

        if let Some(topic) = self.topic().await {
            let message = product_payload(&product_id);
            if let Err(e) = self
                .ctx
                .mqtt
                .publish(topic.topic(), topic.qos(), topic.retain(), &message)
                .await
            {
                warn!(error = %e, "failed to publish popped product id");
            }
        } else {
            warn!(port = %self.asset_port, "pop_element has no ProductID topic resolved, publish skipped");
        }

        NodeStatus::Success
    }

    async fn prime(&self) {
        let _ = self.topic().await;
    }
}

/// `GetProductFromQueue`: the stateful cousin of [`PopElementNode`] — pops
/// and publishes once on entry, then ticks `child` to completion every
/// tick after, forwarding `RUNNING`/the terminal state of the child.
pub struct GetProductFromQueue {
    ctx: Arc<NodeContext>,
    asset_port: String,
    queue_key: String,
    output_key: String,
    if_empty: EmptyStatus,
    child: Arc<dyn Node>,
    topic: OnceCell<Option<TopicDescriptor>>,
    popped: std::sync::atomic::AtomicBool,
}

impl GetProductFromQueue {
    pub fn new(
        ctx: Arc<NodeContext>,
        asset_port: impl Into<String>,
        queue_key: impl Into<String>,
        output_key: impl Into<String>,
        if_empty: EmptyStatus,
        child: Arc<dyn Node>,
    ) -> Self {
        Self {
            ctx,
            asset_port: asset_port.into(),
            queue_key: queue_key.into(),
            output_key: output_key.into(),
            if_empty,
            child,
            topic: OnceCell::new(),
            popped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn topic(&self) -> Option<&TopicDescriptor> {
        self.topic
            .get_or_init(|| async {
                let asset_id = self.ctx.blackboard.get_str(&self.asset_port)?;
                self.ctx.resolve_topic(&asset_id, "productid", Direction::Input).await
            })
            .await
            .as_ref()
    }
}

#[async_trait]
impl Node for GetProductFromQueue {
    async fn tick(&self) -> NodeStatus {
        use std::sync::atomic::Ordering;

        if !self.popped.load(Ordering::SeqCst) {
            let Some(product_id) = self.ctx.blackboard.pop_queue_front(&self.queue_key) else {
                return self.if_empty.into();
            };
            self.ctx.blackboard.set(&self.output_key, product_id.clone());
            if let Some(topic) = self.topic().await {
                let message = product_payload(&product_id);
                if let Err(e) = self
                    .ctx
                    .mqtt
                    .publish(topic.topic(), topic.qos(), topic.retain(), &message)
                    .await
                {
                    warn!(error = %e, "failed to publish popped product id");
                }
            }
            self.popped.store(true, Ordering::SeqCst);
        }

        let child_status = self.child.tick().await;
        if child_status.is_terminal() {
            self.child.halt().await;
            self.popped.store(false, Ordering::SeqCst);
        }

        match child_status {
            NodeStatus::Failure => NodeStatus::Failure,
            _ => NodeStatus::Running,
        }
    }

    async fn halt(&self) {
        self.child.halt().await;
        self.popped.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    async fn prime(&self) {
        let _ = self.topic().await;
        self.child.prime().await;
    }
}

/// Shared `product_index = BatchSize - queue_len` gating logic for
/// [`SamplingGate`] and [`QualityControlGate`]: execute iff
/// `(product_index mod 100) < rate`, with `rate` clamped to `[0, 100]`.
fn should_execute(blackboard: &Blackboard, queue_key: &str, rate: i64) -> bool {
    let rate = rate.clamp(0, 100);
    if rate == 100 {
        return true;
    }
    if rate == 0 {
        return false;
    }
    let batch_size = blackboard.batch_size();
    if batch_size <= 0 {
        return true;
    }
    let current_size = blackboard.queue_len(queue_key) as i64;
    let product_index = batch_size - current_size;
    (product_index.rem_euclid(100)) < rate
}

/// `SamplingGate(SamplingRate%, BatchSize, Queue)`.
pub struct SamplingGate {
    blackboard: Arc<Blackboard>,
    queue_key: String,
    rate: i64,
    child: Arc<dyn Node>,
}

impl SamplingGate {
    pub fn new(blackboard: Arc<Blackboard>, queue_key: impl Into<String>, rate: i64, child: Arc<dyn Node>) -> Self {
        Self {
            blackboard,
            queue_key: queue_key.into(),
            rate,
            child,
        }
    }
}

#[async_trait]
impl Node for SamplingGate {
    async fn tick(&self) -> NodeStatus {
        if should_execute(&self.blackboard, &self.queue_key, self.rate) {
            self.child.tick().await
        } else {
            info!(rate = self.rate, "sampling gate skipping child for this product");
            NodeStatus::Success
        }
    }

    async fn halt(&self) {
        self.child.halt().await;
    }

    async fn prime(&self) {
        self.child.prime().await;
    }
}

/// `QualityControlGate(QCPercentage%, BatchSize, Queue)` — identical
/// gating arithmetic to [`SamplingGate`], kept as a distinct type because
/// the original distinguishes the two by role in the tree (process
/// sampling vs. quality control), not by behaviour.
pub struct QualityControlGate {
    blackboard: Arc<Blackboard>,
    queue_key: String,
    rate: i64,
    child: Arc<dyn Node>,
}

impl QualityControlGate {
    pub fn new(blackboard: Arc<Blackboard>, queue_key: impl Into<String>, rate: i64, child: Arc<dyn Node>) -> Self {
        Self {
            blackboard,
            queue_key: queue_key.into(),
            rate,
            child,
        }
    }
}

#[async_trait]
impl Node for QualityControlGate {
    async fn tick(&self) -> NodeStatus {
        if should_execute(&self.blackboard, &self.queue_key, self.rate) {
            self.child.tick().await
        } else {
            info!(rate = self.rate, "quality control gate skipping child for this product");
            NodeStatus::Success
        }
    }

    async fn halt(&self) {
        self.child.halt().await;
    }

    async fn prime(&self) {
        self.child.prime().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(NodeStatus);

    #[async_trait]
    impl Node for Fixed {
        async fn tick(&self) -> NodeStatus {
            self.0
        }
    }

    #[tokio::test]
    async fn keep_running_returns_if_empty_when_queue_drained() {
        let bb = Arc::new(Blackboard::new());
        let krune = KeepRunningUntilEmpty::new(bb, "ProductIDs", EmptyStatus::Skipped, Arc::new(Fixed(NodeStatus::Success)));
        assert_eq!(krune.tick().await, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn keep_running_resets_child_on_success_and_keeps_running() {
        let bb = Arc::new(Blackboard::new());
        bb.set_queue("ProductIDs", vec!["p1".to_string()]);
        let krune = KeepRunningUntilEmpty::new(bb, "ProductIDs", EmptyStatus::Success, Arc::new(Fixed(NodeStatus::Success)));
        assert_eq!(krune.tick().await, NodeStatus::Running);
    }

    #[test]
    fn sampling_gate_full_rate_always_executes() {
        let bb = Blackboard::new();
        bb.set_queue("ProductIDs", vec!["a".to_string(), "b".to_string()]);
        assert!(should_execute(&bb, "ProductIDs", 100));
    }

    #[test]
    fn sampling_gate_zero_rate_never_executes() {
        let bb = Blackboard::new();
        bb.set_queue("ProductIDs", vec!["a".to_string()]);
        assert!(!should_execute(&bb, "ProductIDs", 0));
    }

    #[test]
    fn sampling_gate_rate_clamped_above_hundred() {
        let bb = Blackboard::new();
        bb.set_queue("ProductIDs", vec!["a".to_string()]);
        assert!(should_execute(&bb, "ProductIDs", 250));
    }

    #[test]
    fn sampling_gate_uses_product_index_modulo_cycle() {
        let bb = Blackboard::new();
        // BatchSize=10, three popped so far -> product_index = 10 - 7 = 3
        bb.set_queue("ProductIDs", vec!["d".to_string(); 7]);
        assert_eq!(bb.batch_size(), 7);
        // force a distinct batch size to exercise the arithmetic directly
        bb.set("__batch_size", 10i64);
        assert!(should_execute(&bb, "ProductIDs", 50));
        assert!(!should_execute(&bb, "ProductIDs", 2));
    }
}
