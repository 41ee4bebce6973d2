//! Per-peer serialized request pipeline.
//!
//! The transport allows one outstanding operation per peer; everything
//! the core wants to send is funneled through this FIFO. Submission
//! failures complete the request immediately with a failure status so
//! callers see exactly one completion either way.

use crate::infrastructure::transport::{Attribute, CommandStatus, LinkError, PeerLink};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// A queued remote operation.
#[derive(Debug, Clone)]
pub enum Operation {
    Read(Attribute),
    Write(Attribute, Vec<u8>),
    SetNotify(Attribute, bool),
}

/// Invoked exactly once per enqueued operation. `value` carries the
/// bytes of a successful read.
pub type Completion = Box<dyn FnOnce(CommandStatus, Option<Vec<u8>>) + Send>;

struct PendingRequest {
    op: Operation,
    on_complete: Option<Completion>,
}

struct QueueInner {
    pending: VecDeque<PendingRequest>,
    in_flight: bool,
}

pub struct CommandQueue {
    link: Arc<dyn PeerLink>,
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    pub fn new(link: Arc<dyn PeerLink>) -> Self {
        Self {
            link,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                in_flight: false,
            }),
        }
    }

    /// Append `op` to the FIFO; starts it immediately when nothing else
    /// is executing for this peer.
    pub fn enqueue(&self, op: Operation, on_complete: Option<Completion>) {
        let start = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.push_back(PendingRequest { op, on_complete });
            if inner.in_flight {
                false
            } else {
                inner.in_flight = true;
                true
            }
        };
        if start {
            self.run_front();
        }
    }

    /// Called by the transport glue when the outstanding operation
    /// finishes. Pops the head, fires its callback, starts the next.
    pub fn operation_finished(&self, status: CommandStatus, value: Option<Vec<u8>>) {
        if self.finish_current(status, value) {
            self.run_front();
        }
    }

    /// Executes queue heads until one is accepted by the link. A
    /// synchronous rejection counts as a failure completion and the
    /// queue keeps advancing.
    fn run_front(&self) {
        loop {
            let op = {
                let inner = self.inner.lock().unwrap();
                match inner.pending.front() {
                    Some(req) => req.op.clone(),
                    None => return,
                }
            };
            match self.submit(&op) {
                Ok(()) => return,
                Err(e) => {
                    warn!("submission of {:?} rejected: {}", op, e);
                    if !self.finish_current(CommandStatus::Failure, None) {
                        return;
                    }
                }
            }
        }
    }

    fn submit(&self, op: &Operation) -> Result<(), LinkError> {
        match op {
            Operation::Read(attr) => self.link.read(*attr),
            Operation::Write(attr, value) => self.link.write(*attr, value),
            Operation::SetNotify(attr, enable) => self.link.set_notify(*attr, *enable),
        }
    }

    /// Completes the head request; returns whether another request is
    /// waiting to be started.
    fn finish_current(&self, status: CommandStatus, value: Option<Vec<u8>>) -> bool {
        let finished = self.inner.lock().unwrap().pending.pop_front();
        let Some(req) = finished else {
            // Protocol anomaly: the transport reported a completion we
            // never asked for. Must not advance the queue either.
            warn!("completion with empty queue ignored (status {:?})", status);
            return false;
        };
        if let Some(cb) = req.on_complete {
            cb(status, value);
        }

        // The callback may have enqueued more work; decide under the lock.
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.is_empty() {
            inner.in_flight = false;
            false
        } else {
            true
        }
    }
}
