//! Deferred-task queue
//!
//! Replaces the host event loop's idle callbacks: trace and notify
//! deliveries flagged as deferred are queued here and run when the embedder
//! drains the queue. De-duplication is keyed per combination — a trace task
//! by (client, trace, node, key, flags), a notifier task by (client,
//! notifier), the latter overwriting its payload with the newest event —
//! so re-firing before the queue drains never enqueues a duplicate.
//!
//! Cancellation removes every task queued on behalf of a closed client or
//! a deleted trace/notifier.

use crate::ids::{ClientId, NotifyId, TraceId};
use crate::key::Key;
use crate::node::NodeId;
use crate::notify::NotifyEvent;
use crate::trace::TraceMask;
use std::collections::VecDeque;

/// One pending deferred delivery
pub(crate) enum PendingTask {
    Trace {
        client: ClientId,
        trace: TraceId,
        node: NodeId,
        key: Key,
        mask: TraceMask,
    },
    Notify {
        client: ClientId,
        notifier: NotifyId,
        event: NotifyEvent,
    },
}

/// FIFO of deferred deliveries with per-combination de-duplication
#[derive(Default)]
pub(crate) struct IdleQueue {
    tasks: VecDeque<PendingTask>,
}

impl IdleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Queue a trace delivery unless the same (client, trace, node, key,
    /// flags) combination is already pending.
    pub fn enqueue_trace(
        &mut self,
        client: ClientId,
        trace: TraceId,
        node: NodeId,
        key: &Key,
        mask: TraceMask,
    ) {
        let duplicate = self.tasks.iter().any(|task| match task {
            PendingTask::Trace {
                client: c,
                trace: t,
                node: n,
                key: k,
                mask: m,
            } => *c == client && *t == trace && *n == node && *k == *key && m.bits() == mask.bits(),
            PendingTask::Notify { .. } => false,
        });
        if duplicate {
            return;
        }
        self.tasks.push_back(PendingTask::Trace {
            client,
            trace,
            node,
            key: key.clone(),
            mask,
        });
    }

    /// Queue a notifier delivery, overwriting the payload of an already
    /// pending task for the same handler (latest event wins).
    pub fn enqueue_notify(&mut self, client: ClientId, notifier: NotifyId, event: NotifyEvent) {
        for task in self.tasks.iter_mut() {
            if let PendingTask::Notify {
                client: c,
                notifier: h,
                event: e,
            } = task
            {
                if *c == client && *h == notifier {
                    *e = event;
                    return;
                }
            }
        }
        self.tasks.push_back(PendingTask::Notify {
            client,
            notifier,
            event,
        });
    }

    /// Pop the oldest pending task
    pub fn pop(&mut self) -> Option<PendingTask> {
        self.tasks.pop_front()
    }

    /// Drop every task queued on behalf of `client`
    pub fn cancel_client(&mut self, client: ClientId) {
        self.tasks.retain(|task| match task {
            PendingTask::Trace { client: c, .. } => *c != client,
            PendingTask::Notify { client: c, .. } => *c != client,
        });
    }

    /// Drop every task queued on behalf of one trace registration
    pub fn cancel_trace(&mut self, client: ClientId, trace: TraceId) {
        self.tasks.retain(|task| match task {
            PendingTask::Trace {
                client: c,
                trace: t,
                ..
            } => !(*c == client && *t == trace),
            PendingTask::Notify { .. } => true,
        });
    }

    /// Drop every task queued on behalf of one notifier registration
    pub fn cancel_notifier(&mut self, client: ClientId, notifier: NotifyId) {
        self.tasks.retain(|task| match task {
            PendingTask::Notify {
                client: c,
                notifier: h,
                ..
            } => !(*c == client && *h == notifier),
            PendingTask::Trace { .. } => true,
        });
    }

    /// Drop everything (core teardown)
    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}
