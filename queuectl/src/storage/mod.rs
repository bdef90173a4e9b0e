//! In-memory request store and admission queue.
//!
//! The store owns every [`RequestRecord`](crate::request::RequestRecord) for the lifetime of the
//! process together with the FIFO admission queue that decides who runs next. All mutation goes
//! through a single lock so that admission, the worker's pop and terminal transitions are each
//! observed atomically. Nothing is evicted; a restart clears everything.
//!
//! Waiters never poll. Every change that can move a queue position or finish a request bumps a
//! version counter on a [`watch`] channel, and the worker is woken through a [`Notify`] when work
//! arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::errors::{Error, Result};
use crate::request::{
    AnyRequest, GenerationRequest, Processing, Queued, Request, RequestData, RequestRecord, RequestState,
};
use crate::stream::OutputEvent;
use crate::types::{ClientTag, RequestId};

/// Result of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub id: RequestId,
    /// 1-based rank among queued requests at the moment of admission
    pub entry_position: usize,
}

/// Process-wide counters, reported by the status and health endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct QueueStats {
    pub total_received: u64,
    /// Requests that reached `complete`
    pub total_processed: u64,
    /// Requests that reached `error`
    pub total_errors: u64,
    /// The request currently in `processing`, if any
    #[schema(value_type = Option<String>)]
    pub current_request_id: Option<RequestId>,
}

/// Sender half of a request's output channel, handed to the worker on claim.
pub type OutputSender = mpsc::UnboundedSender<OutputEvent>;
/// Receiver half of a request's output channel, handed to at most one stream.
pub type OutputReceiver = mpsc::UnboundedReceiver<OutputEvent>;

struct Slot {
    request: AnyRequest,
    /// Admission sequence number, 0-based and gap-free
    seq: u64,
    output: Option<OutputReceiver>,
    /// Set once a stream has attached; until then the output is dropped at the terminal transition
    listened: bool,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<RequestId, Slot>,
    queue: VecDeque<RequestId>,
    admitted: u64,
    popped: u64,
    stats: QueueStats,
}

impl Inner {
    fn position_of(&self, slot: &Slot) -> usize {
        if slot.request.is_queued() {
            (slot.seq - self.popped + 1) as usize
        } else {
            0
        }
    }
}

/// Shared handle to the request store. Cloning is cheap; all clones see the same state.
#[derive(Clone)]
pub struct RequestStore {
    inner: Arc<RwLock<Inner>>,
    changes: Arc<watch::Sender<u64>>,
    work: Arc<Notify>,
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            changes: Arc::new(changes),
            work: Arc::new(Notify::new()),
        }
    }

    /// Validate a payload and append it to the tail of the admission queue.
    ///
    /// Never rejects for capacity: the queue is unbounded.
    pub fn submit(&self, payload: GenerationRequest, client_tag: ClientTag) -> Result<Admission> {
        payload.validate()?;

        let id = RequestId::new();
        let admission = {
            let mut inner = self.inner.write();
            let entry_position = inner.queue.len() + 1;
            let seq = inner.admitted;

            let request = Request {
                state: Queued {},
                data: RequestData {
                    id,
                    client_tag,
                    payload,
                    entry_position,
                    created_at: Utc::now(),
                },
            };

            inner.slots.insert(
                id,
                Slot {
                    request: request.into(),
                    seq,
                    output: None,
                    listened: false,
                },
            );
            inner.queue.push_back(id);
            inner.admitted += 1;
            inner.stats.total_received += 1;

            gauge!("queuectl_queue_depth").set(inner.queue.len() as f64);
            Admission { id, entry_position }
        };

        counter!("queuectl_requests_received_total").increment(1);
        info!(request_id = %id, entry_position = admission.entry_position, "Request queued");

        self.work.notify_one();
        Ok(admission)
    }

    /// Atomically pop the head of the queue, move it to `Processing` and open its output channel.
    ///
    /// Returns `None` when the queue is empty.
    pub fn claim_next(&self) -> Option<(Request<Processing>, OutputSender)> {
        let claimed = {
            let mut inner = self.inner.write();
            let id = inner.queue.pop_front()?;
            inner.popped += 1;

            let depth = inner.queue.len();
            let slot = inner.slots.get_mut(&id)?;
            let queued = slot.request.clone().into_queued()?;
            let processing = queued.start();

            let (tx, rx) = mpsc::unbounded_channel();
            slot.request = processing.clone().into();
            slot.output = Some(rx);
            inner.stats.current_request_id = Some(id);

            gauge!("queuectl_queue_depth").set(depth as f64);
            (processing, tx)
        };

        debug!(request_id = %claimed.0.data.id, "Request claimed for processing");
        self.changes.send_modify(|version| *version += 1);
        Some(claimed)
    }

    /// Write back a transitioned request.
    ///
    /// Terminal records are never overwritten. Reaching a terminal state updates the counters and
    /// wakes anyone waiting on the request.
    pub fn persist<T: RequestState + Clone>(&self, request: &Request<T>) -> Result<()>
    where
        AnyRequest: From<Request<T>>,
    {
        let id = request.data.id;
        let updated: AnyRequest = request.clone().into();

        {
            let mut inner = self.inner.write();
            let slot = inner.slots.get_mut(&id).ok_or_else(|| Error::request_not_found(id))?;

            if slot.request.is_terminal() {
                return Err(Error::InvalidState {
                    id,
                    actual: slot.request.status().to_string(),
                    expected: "a non-terminal state".to_string(),
                });
            }

            let terminal = updated.is_terminal();
            let failed = matches!(updated, AnyRequest::Failed(_));
            slot.request = updated;

            if terminal {
                // Nobody will read it; late attachers replay from the record
                if !slot.listened {
                    slot.output = None;
                }
                if failed {
                    inner.stats.total_errors += 1;
                    counter!("queuectl_requests_failed_total").increment(1);
                } else {
                    inner.stats.total_processed += 1;
                    counter!("queuectl_requests_completed_total").increment(1);
                }
                if inner.stats.current_request_id == Some(id) {
                    inner.stats.current_request_id = None;
                }
            }
        }

        self.changes.send_modify(|version| *version += 1);
        Ok(())
    }

    /// Point-in-time copy of a record.
    pub fn get(&self, id: RequestId) -> Option<RequestRecord> {
        self.inner.read().slots.get(&id).map(|slot| RequestRecord::from(&slot.request))
    }

    /// Like [`get`](Self::get), but an unknown id is a `NotFound` error.
    pub fn get_status(&self, id: RequestId) -> Result<RequestRecord> {
        self.get(id).ok_or_else(|| Error::request_not_found(id))
    }

    /// Live 1-based queue position, `0` once the request has left the queue.
    pub fn position(&self, id: RequestId) -> Option<usize> {
        let inner = self.inner.read();
        inner.slots.get(&id).map(|slot| inner.position_of(slot))
    }

    /// A record together with its live position, read under one lock.
    pub fn get_with_position(&self, id: RequestId) -> Option<(RequestRecord, usize)> {
        let inner = self.inner.read();
        inner
            .slots
            .get(&id)
            .map(|slot| (RequestRecord::from(&slot.request), inner.position_of(slot)))
    }

    /// Like [`get_with_position`](Self::get_with_position), and registers a listener so the
    /// output channel survives the terminal transition until it is taken.
    pub fn listen(&self, id: RequestId) -> Option<(RequestRecord, usize)> {
        let mut inner = self.inner.write();
        let slot = inner.slots.get_mut(&id)?;
        slot.listened = true;
        let record = RequestRecord::from(&slot.request);
        let position = inner.position_of(&inner.slots[&id]);
        Some((record, position))
    }

    /// Number of requests still waiting to be popped.
    pub fn queue_depth(&self) -> usize {
        self.inner.read().queue.len()
    }

    /// Number of records retained, in any state.
    pub fn tracked_requests(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.read().stats.clone()
    }

    /// Hand out the receiver of a request's output channel. Only the first caller gets it.
    pub fn take_output(&self, id: RequestId) -> Option<OutputReceiver> {
        self.inner.write().slots.get_mut(&id).and_then(|slot| slot.output.take())
    }

    /// Subscribe to store changes (pops and terminal transitions).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Resolves once new work may be available. Permits are stored, so a submit that lands
    /// before the worker starts waiting is not lost.
    pub async fn work_available(&self) {
        self.work.notified().await
    }
}
