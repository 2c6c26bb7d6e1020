//! `BC_Fallback` control node (§4.5.6): a fallback over action children
//! whose first child is instead a post-condition, re-checked after every
//! action's `SUCCESS` before the control node itself reports `SUCCESS`.
//!
//! Grounded on `BC_FallbackNode`
//! (`original_source/BT_Controller/include/bt/controls/bc_fallback_node.h`
//! and its `.cpp`): children\[0\] is the post-condition; the loop still
//! starts at index 0, so the post-condition is itself tried first as an
//! action before any other child. Every subsequent `SUCCESS` (index > 0)
//! re-ticks children\[0\]; a `RUNNING` post-condition suspends the whole
//! node and resumes the post-condition check (not the action loop) on the
//! next tick. All children `FAILURE` resets and reports `FAILURE` (or
//! `SKIPPED` if every child was skipped).
//!
//! The `asynch` variant yields `RUNNING` once per failed child instead of
//! falling through to the next sibling in the same tick, so a long
//! fallback chain cannot starve the rest of the tree within one tick —
//! this crate has no per-child "was already running" probe to reproduce
//! the original's narrower `prev_status == IDLE` guard, so it yields on
//! every failure rather than only the first.

use crate::bt::tree::{Node, NodeStatus};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    current_child_idx: usize,
    checking_post_cond: bool,
    saved_child_idx: usize,
    skipped_count: usize,
    started: bool,
}

pub struct BcFallback {
    children: Vec<Arc<dyn Node>>,
    asynch: bool,
    state: Mutex<State>,
}

impl BcFallback {
    pub fn new(children: Vec<Arc<dyn Node>>, asynch: bool) -> Self {
        assert!(!children.is_empty(), "BC_Fallback requires at least a post-condition child");
        Self {
            children,
            asynch,
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl Node for BcFallback {
    async fn tick(&self) -> NodeStatus {
        let children_count = self.children.len();
        let post_cond = &self.children[0];

        let (mut idx, checking_post_cond) = {
            let mut state = self.state.lock().expect("bc_fallback state mutex poisoned");
            if !state.started {
                state.skipped_count = 0;
                state.checking_post_cond = false;
                state.saved_child_idx = 0;
                state.started = true;
            }
            (state.current_child_idx, state.checking_post_cond)
        };

        if checking_post_cond {
            match post_cond.tick().await {
                NodeStatus::Running => return NodeStatus::Running,
                NodeStatus::Failure | NodeStatus::Skipped | NodeStatus::Idle => {
                    let mut state = self.state.lock().expect("bc_fallback state mutex poisoned");
                    idx = state.saved_child_idx + 1;
                    state.current_child_idx = idx;
                    state.skipped_count += 1;
                    state.checking_post_cond = false;
                }
                NodeStatus::Success => {
                    let mut state = self.state.lock().expect("bc_fallback state mutex poisoned");
                    state.checking_post_cond = false;
                    state.current_child_idx = 0;
                    state.started = false;
                    drop(state);
                    self.halt_children().await;
                    return NodeStatus::Success;
                }
            }
        }

        while idx < children_count {
            let child_status = self.children[idx].tick().await;

            match child_status {
                NodeStatus::Running => {
                    self.state.lock().expect("bc_fallback state mutex poisoned").current_child_idx = idx;
                    return NodeStatus::Running;
                }
                NodeStatus::Success => {
                    if idx > 0 {
                        match post_cond.tick().await {
                            NodeStatus::Running => {
                                let mut state = self.state.lock().expect("bc_fallback state mutex poisoned");
                                state.checking_post_cond = true;
                                state.saved_child_idx = idx;
                                return NodeStatus::Running;
                            }
                            NodeStatus::Failure | NodeStatus::Skipped | NodeStatus::Idle => {
                                idx += 1;
                                let mut state = self.state.lock().expect("bc_fallback state mutex poisoned");
                                state.current_child_idx = idx;
                                state.skipped_count += 1;
                                continue;
                            }
                            NodeStatus::Success => {}
                        }
                    }
                    let mut state = self.state.lock().expect("bc_fallback state mutex poisoned");
                    state.current_child_idx = 0;
                    state.started = false;
                    drop(state);
                    self.halt_children().await;
                    return NodeStatus::Success;
                }
                NodeStatus::Failure => {
                    idx += 1;
                    self.state.lock().expect("bc_fallback state mutex poisoned").current_child_idx = idx;
                    if self.asynch && idx < children_count {
                        return NodeStatus::Running;
                    }
                }
                NodeStatus::Skipped => {
                    idx += 1;
                    let mut state = self.state.lock().expect("bc_fallback state mutex poisoned");
                    state.current_child_idx = idx;
                    state.skipped_count += 1;
                }
                NodeStatus::Idle => unreachable!("a ticked child never reports Idle"),
            }
        }

        let mut state = self.state.lock().expect("bc_fallback state mutex poisoned");
        state.current_child_idx = 0;
        state.started = false;
        let skipped_count = state.skipped_count;
        drop(state);

        if skipped_count == children_count {
            NodeStatus::Skipped
        } else {
            NodeStatus::Failure
        }
    }

    async fn halt(&self) {
        self.halt_children().await;
        let mut state = self.state.lock().expect("bc_fallback state mutex poisoned");
        state.current_child_idx = 0;
        state.checking_post_cond = false;
        state.started = false;
    }

    async fn prime(&self) {
        for child in &self.children {
            child.prime().await;
        }
    }
}

impl BcFallback {
    async fn halt_children(&self) {
        for child in &self.children {
            child.halt().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Fixed(NodeStatus);

    #[async_trait]
    impl Node for Fixed {
        async fn tick(&self) -> NodeStatus {
            self.0
        }
    }

    /// Fails its first tick, succeeds every tick after — stands in for a
    /// post-condition that only becomes true once an action has run.
    struct FailsOnceThenSucceeds(StdMutex<usize>);

    #[async_trait]
    impl Node for FailsOnceThenSucceeds {
        async fn tick(&self) -> NodeStatus {
            let mut calls = self.0.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                NodeStatus::Failure
            } else {
                NodeStatus::Success
            }
        }
    }

    #[tokio::test]
    async fn post_condition_success_short_circuits() {
        let bc = BcFallback::new(vec![Arc::new(Fixed(NodeStatus::Success))], false);
        assert_eq!(bc.tick().await, NodeStatus::Success);
    }

    #[tokio::test]
    async fn action_success_then_passing_post_condition_finalizes() {
        let bc = BcFallback::new(
            vec![
                Arc::new(FailsOnceThenSucceeds(StdMutex::new(0))),
                Arc::new(Fixed(NodeStatus::Failure)),
                Arc::new(Fixed(NodeStatus::Success)),
            ],
            false,
        );
        assert_eq!(bc.tick().await, NodeStatus::Success);
    }

    #[tokio::test]
    async fn all_failure_is_failure() {
        let bc = BcFallback::new(
            vec![Arc::new(Fixed(NodeStatus::Failure)), Arc::new(Fixed(NodeStatus::Failure))],
            false,
        );
        assert_eq!(bc.tick().await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn asynch_yields_running_between_failed_children() {
        let bc = BcFallback::new(
            vec![
                Arc::new(FailsOnceThenSucceeds(StdMutex::new(0))),
                Arc::new(Fixed(NodeStatus::Failure)),
                Arc::new(Fixed(NodeStatus::Success)),
            ],
            true,
        );
        assert_eq!(bc.tick().await, NodeStatus::Running);
        assert_eq!(bc.tick().await, NodeStatus::Running);
        assert_eq!(bc.tick().await, NodeStatus::Success);
    }
}
