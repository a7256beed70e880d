//! Trace and notify fan-out
//!
//! Dispatch happens in three phases so that no `RefCell` borrow is held
//! while a callback runs (callbacks are free to re-enter the tree API):
//! collect matching registrations from every attached client, release all
//! borrows, then invoke. Callback errors land in the core's side channel
//! and never abort the mutation that triggered them.

use crate::core::CoreRef;
use crate::ids::ClientId;
use crate::idle::PendingTask;
use crate::key::Key;
use crate::node::NodeId;
use crate::notify::{NotifyEvent, NotifyReg};
use crate::trace::{TraceEvent, TraceMask, TraceReg};
use std::rc::Rc;

/// Fire value traces for one read/write/create/unset event
pub(crate) fn fire_value_traces(
    core: &CoreRef,
    origin: ClientId,
    node: NodeId,
    key: &Key,
    mask: TraceMask,
) {
    let (root, clients, node_active) = {
        let c = core.borrow();
        let active = c.node_opt(node).map(|n| n.trace_active).unwrap_or(false);
        (c.root, c.client_handles(), active)
    };
    // A value event on a node whose trace callback is still unwinding is
    // suppressed entirely (no re-entrant storms).
    if node_active {
        return;
    }

    let mut immediate: Vec<Rc<TraceReg>> = Vec::new();
    let mut deferred: Vec<(ClientId, Rc<TraceReg>)> = Vec::new();
    let write_class = TraceMask::WRITE | TraceMask::CREATE | TraceMask::UNSET;
    for (cid, handle) in &clients {
        let inner = handle.borrow();
        let tags_rc = inner.tags.clone();
        let tags = tags_rc.borrow();
        let mut scan = |regs: &[Rc<TraceReg>]| {
            for reg in regs {
                if reg.matches(*cid, origin, node, key, mask, root, &tags) {
                    if reg.deferred {
                        deferred.push((*cid, reg.clone()));
                    } else {
                        immediate.push(reg.clone());
                    }
                }
            }
        };
        if mask.intersects(TraceMask::READ) {
            scan(&inner.read_traces);
        }
        if mask.intersects(write_class) {
            scan(&inner.write_traces);
        }
    }

    if !deferred.is_empty() {
        let mut c = core.borrow_mut();
        for (cid, reg) in deferred {
            c.idle.enqueue_trace(cid, reg.id, node, key, mask);
        }
    }

    if immediate.is_empty() {
        return;
    }
    set_trace_active(core, node, true);
    let event = TraceEvent {
        node,
        key: key.clone(),
        mask,
    };
    for reg in immediate {
        if let Err(e) = (reg.callback)(&event) {
            core.borrow_mut().callback_errors.push(e);
        }
    }
    set_trace_active(core, node, false);
}

fn set_trace_active(core: &CoreRef, node: NodeId, active: bool) {
    let mut c = core.borrow_mut();
    if let Ok(n) = c.node_mut(node) {
        n.trace_active = active;
    }
}

/// Fire one structural event at every attached client's notifiers
pub(crate) fn fire_notify(core: &CoreRef, origin: ClientId, event: NotifyEvent) {
    let clients = core.borrow().client_handles();

    let mut immediate: Vec<Rc<NotifyReg>> = Vec::new();
    let mut deferred: Vec<(ClientId, Rc<NotifyReg>)> = Vec::new();
    for (cid, handle) in &clients {
        let inner = handle.borrow();
        for reg in &inner.notifiers {
            if !reg.mask.intersects(event.event) {
                continue;
            }
            if reg.foreign_only && *cid == origin {
                continue;
            }
            if reg.deferred {
                deferred.push((*cid, reg.clone()));
            } else if !reg.active.get() {
                immediate.push(reg.clone());
            }
        }
    }

    if !deferred.is_empty() {
        let mut c = core.borrow_mut();
        for (cid, reg) in deferred {
            c.idle.enqueue_notify(cid, reg.id, event);
        }
    }

    for reg in immediate {
        // Re-check: a handler may have gone active through nesting
        if reg.active.get() {
            continue;
        }
        reg.active.set(true);
        let outcome = (reg.callback)(&event);
        reg.active.set(false);
        if let Err(e) = outcome {
            core.borrow_mut().callback_errors.push(e);
        }
    }
}

/// Run every pending deferred delivery. Returns how many callbacks ran.
pub(crate) fn drain(core: &CoreRef) -> usize {
    let mut delivered = 0;
    loop {
        let task = core.borrow_mut().idle.pop();
        let Some(task) = task else { break };
        match task {
            PendingTask::Trace {
                client,
                trace,
                node,
                key,
                mask,
            } => {
                let Some(handle) = core.borrow().client_by_id(client) else {
                    continue;
                };
                let Some(reg) = handle.borrow().find_trace(trace) else {
                    continue;
                };
                // The recursion guard applies to deferred delivery too
                let active = {
                    let c = core.borrow();
                    c.node_opt(node).map(|n| n.trace_active).unwrap_or(false)
                };
                if active {
                    continue;
                }
                set_trace_active(core, node, true);
                let event = TraceEvent { node, key, mask };
                if let Err(e) = (reg.callback)(&event) {
                    core.borrow_mut().callback_errors.push(e);
                }
                set_trace_active(core, node, false);
                delivered += 1;
            }
            PendingTask::Notify {
                client,
                notifier,
                event,
            } => {
                let Some(handle) = core.borrow().client_by_id(client) else {
                    continue;
                };
                let Some(reg) = handle.borrow().find_notifier(notifier) else {
                    continue;
                };
                if reg.active.get() {
                    continue;
                }
                reg.active.set(true);
                let outcome = (reg.callback)(&event);
                reg.active.set(false);
                if let Err(e) = outcome {
                    core.borrow_mut().callback_errors.push(e);
                }
                delivered += 1;
            }
        }
    }
    delivered
}
