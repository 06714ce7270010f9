//! Per-component response lanes.
//!
//! Every component opened through a [`Proxy`](crate::proxy::Proxy) owns two
//! FIFO lanes. Buffer lifecycle events land on the ack lane so they are
//! never queued behind control-plane replies on the async lane. The
//! proxy's receive path hands each message to the component's
//! [`ResponseSink`], which decides where it goes; the default
//! [`LaneRouter`] classifies by opcode alone.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::Message;
use crate::opcode::Lane;
use crate::queue::Queue;

/// The two response queues of one component.
#[derive(Default)]
pub struct Lanes {
    ack: Mutex<Queue<Message>>,
    control: Mutex<Queue<Message>>,
}

impl Lanes {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, lane: Lane) -> &Mutex<Queue<Message>> {
        match lane {
            Lane::Ack => &self.ack,
            Lane::Async => &self.control,
        }
    }

    /// Append `msg` to `lane`. Returns `true` if the lane was empty.
    pub fn push(&self, lane: Lane, msg: Message) -> bool {
        self.queue(lane).lock().enqueue(msg)
    }

    pub fn pop(&self, lane: Lane) -> Option<Message> {
        self.queue(lane).lock().dequeue()
    }

    pub fn len(&self, lane: Lane) -> usize {
        self.queue(lane).lock().len()
    }

    pub fn is_empty(&self, lane: Lane) -> bool {
        self.queue(lane).lock().is_empty()
    }

    /// Remove every message on `lane` matching `pred`.
    pub fn take_where(&self, lane: Lane, pred: impl FnMut(&Message) -> bool) -> Vec<Message> {
        self.queue(lane).lock().take_where(pred)
    }
}

/// Receives every message addressed to one component.
///
/// Called on whichever thread is currently draining the transport, so
/// implementations must not block.
pub trait ResponseSink: Send + Sync {
    fn deliver(&self, lanes: &Lanes, msg: Message);
}

/// Default sink: queue on the lane the opcode belongs to.
#[derive(Debug, Default, Clone, Copy)]
pub struct LaneRouter;

impl ResponseSink for LaneRouter {
    fn deliver(&self, lanes: &Lanes, msg: Message) {
        lanes.push(Lane::classify(msg.opcode), msg);
    }
}

/// Host-side endpoint of one component, registered with the proxy.
pub(crate) struct Endpoint {
    pub(crate) name: String,
    pub(crate) lanes: Lanes,
    pub(crate) sink: Arc<dyn ResponseSink>,
    closing: AtomicBool,
}

impl Endpoint {
    pub(crate) fn new(name: &str, sink: Option<Arc<dyn ResponseSink>>) -> Self {
        Endpoint {
            name: name.to_owned(),
            lanes: Lanes::new(),
            sink: sink.unwrap_or_else(|| Arc::new(LaneRouter)),
            closing: AtomicBool::new(false),
        }
    }

    /// From here on an `UNREGISTER` for this endpoint is the expected
    /// acknowledgement of a close.
    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn deliver(&self, msg: Message) {
        self.sink.deliver(&self.lanes, msg);
    }
}
