//! Batched priority queue
//!
//! Conceptually a stack of FIFO queues. Every call to
//! [`PriorityQueue::open_new_batch`] starts a batch that is served ahead of
//! all older pending work, while requests inside one batch start in arrival
//! order.
//!
//! The pending requests form a doubly-linked list stored in an arena keyed by
//! [`RequestId`]. Two cursors index into it:
//!
//! - `head`: next request to activate
//! - `batch_tail`: last request inserted into the open batch, `None` once the
//!   batch is closed
//!
//! The open batch is always a prefix of the list (`head..=batch_tail`), so an
//! insertion with no open batch goes in front of `head` and an insertion into
//! the open batch goes right after `batch_tail`.
//!
//! The queue itself performs no I/O. Mutations that free or fill a
//! concurrency slot leave [`Activation`]s behind, which the owner drains with
//! [`PriorityQueue::take_activations`] and executes.

use crate::cancel::CancellationToken;
use crate::error::TransferError;
use crate::request::{
    Progress, RequestHandle, RequestId, RequestState, RequestStatus, StatusSender, TransportKind,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Identifies one scheduling batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BatchToken(u64);

impl BatchToken {
    /// Sequence number; later batches compare greater
    pub fn get(self) -> u64 {
        self.0
    }
}

/// What [`PriorityQueue::enqueue`] did with a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// New request, activated immediately
    Started,
    /// New request, waiting in the open batch
    Queued,
    /// Existing queued request moved into the open batch
    Promoted,
    /// Existing active request, observed as is
    Joined,
}

/// Result of an enqueue
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub handle: RequestHandle,
    pub disposition: Disposition,
}

/// A request that just received a concurrency slot and must be executed
#[derive(Debug, Clone)]
pub struct Activation {
    id: RequestId,
    url: Arc<str>,
    cancel: CancellationToken,
    status: StatusSender,
}

impl Activation {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn status(&self) -> &StatusSender {
        &self.status
    }
}

#[derive(Debug)]
struct Entry {
    url: Arc<str>,
    state: RequestState,
    transport: TransportKind,
    batch: BatchToken,
    next: Option<RequestId>,
    prev: Option<RequestId>,
    cancel: CancellationToken,
    status: StatusSender,
}

/// Bounded-concurrency batched scheduler
///
/// Not synchronized; the owner serializes access (see
/// [`DownloadQueue`](crate::DownloadQueue)).
#[derive(Debug)]
pub struct PriorityQueue {
    concurrency: usize,
    active: usize,
    head: Option<RequestId>,
    batch_tail: Option<RequestId>,
    batch: BatchToken,
    next_id: u64,
    entries: HashMap<RequestId, Entry>,
    by_url: HashMap<Arc<str>, RequestId>,
    ready: Vec<Activation>,
}

impl PriorityQueue {
    /// Create an empty queue running at most `concurrency` requests at once
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            active: 0,
            head: None,
            batch_tail: None,
            batch: BatchToken::default(),
            next_id: 1,
            entries: HashMap::new(),
            by_url: HashMap::new(),
            ready: Vec::new(),
        }
    }

    /// Request `url`, joining a live request for the same URL if there is one.
    pub fn enqueue(&mut self, url: &str) -> Enqueued {
        let live = self
            .by_url
            .get(url)
            .copied()
            .filter(|id| self.entries.get(id).is_some_and(|entry| !entry.cancel.is_cancelled()));
        if let Some(id) = live {
            if let Some(handle) = self.handle(id) {
                let disposition = if self.promote(id) {
                    Disposition::Promoted
                } else {
                    Disposition::Joined
                };
                debug!(request = %id, url, ?disposition, "duplicate request");
                return Enqueued {
                    handle,
                    disposition,
                };
            }
        }

        let id = RequestId(self.next_id);
        self.next_id += 1;

        let url: Arc<str> = Arc::from(url);
        let (status, _) = watch::channel(RequestStatus::Queued);
        let status = Arc::new(status);
        let handle = RequestHandle::new(id, url.clone(), status.subscribe());

        self.entries.insert(
            id,
            Entry {
                url: url.clone(),
                state: RequestState::Queued,
                transport: TransportKind::Primary,
                batch: self.batch,
                next: None,
                prev: None,
                cancel: CancellationToken::new(),
                status,
            },
        );
        self.by_url.insert(url, id);

        let disposition = if self.insert(id) {
            Disposition::Started
        } else {
            Disposition::Queued
        };
        debug!(request = %id, url = handle.url(), ?disposition, batch = self.batch.0, "enqueued");

        Enqueued {
            handle,
            disposition,
        }
    }

    /// Move a queued request into the open batch (or open one with it).
    ///
    /// Returns `false` if the request is not queued.
    pub fn promote(&mut self, id: RequestId) -> bool {
        if self.state(id) != Some(RequestState::Queued) {
            return false;
        }

        self.unlink(id);
        self.insert(id);
        true
    }

    /// Close the open batch; the next insertion opens a newer batch that is
    /// served before everything already pending.
    pub fn open_new_batch(&mut self) -> BatchToken {
        self.batch = BatchToken(self.batch.0 + 1);
        self.batch_tail = None;
        self.batch
    }

    /// Alias of [`open_new_batch`](Self::open_new_batch) for callers that do
    /// not need the token.
    pub fn reset_priority(&mut self) {
        self.open_new_batch();
    }

    /// Cancel a request.
    ///
    /// A queued request is marked and left linked until the scheduler reaches
    /// it. An active request has its token cancelled and stops accepting new
    /// observers; its slot is released by [`finish`](Self::finish) once the
    /// transport unwinds. Returns `false`
    /// when there was nothing left to cancel.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };

        match entry.state {
            RequestState::Queued => {
                entry.state = RequestState::Cancelled;
                entry.status.send_replace(RequestStatus::Cancelled);
                if self.by_url.get(&entry.url) == Some(&id) {
                    self.by_url.remove(&entry.url);
                }
                debug!(request = %id, "cancelled while queued");
                true
            }
            RequestState::Active => {
                if self.by_url.get(&entry.url) == Some(&id) {
                    self.by_url.remove(&entry.url);
                }
                debug!(request = %id, "cancelling active request");
                entry.cancel.cancel()
            }
            _ => false,
        }
    }

    /// Terminal transition of an active request.
    ///
    /// Publishes the outcome, frees the slot and activates whatever comes next.
    /// Runs at most once per request; later calls return `false`.
    pub fn finish(&mut self, id: RequestId, outcome: Result<Bytes, TransferError>) -> bool {
        if self.state(id) != Some(RequestState::Active) {
            return false;
        }
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };

        self.active -= 1;
        if self.by_url.get(&entry.url) == Some(&id) {
            self.by_url.remove(&entry.url);
        }

        let status = match outcome {
            Ok(bytes) => RequestStatus::Complete(bytes),
            Err(TransferError::Cancelled) => RequestStatus::Cancelled,
            Err(err) => RequestStatus::Failed(err),
        };
        debug!(request = %id, state = ?status.state(), "finished");
        entry.status.send_replace(status);

        self.schedule_next();
        true
    }

    /// Record which transport is carrying an active request
    pub fn set_transport(&mut self, id: RequestId, transport: TransportKind) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.transport = transport;
        }
    }

    /// Drain the activations produced since the last call
    pub fn take_activations(&mut self) -> Vec<Activation> {
        std::mem::take(&mut self.ready)
    }

    /// New observer for a live request
    pub fn handle(&self, id: RequestId) -> Option<RequestHandle> {
        self.entries
            .get(&id)
            .filter(|entry| !entry.state.is_terminal())
            .map(|entry| RequestHandle::new(id, entry.url.clone(), entry.status.subscribe()))
    }

    /// State of a request still tracked by the queue
    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.entries.get(&id).map(|entry| entry.state)
    }

    /// Transport recorded for a live request
    pub fn transport(&self, id: RequestId) -> Option<TransportKind> {
        self.entries.get(&id).map(|entry| entry.transport)
    }

    /// Batch a request was last inserted into
    pub fn batch_of(&self, id: RequestId) -> Option<BatchToken> {
        self.entries.get(&id).map(|entry| entry.batch)
    }

    /// Current batch
    pub fn batch(&self) -> BatchToken {
        self.batch
    }

    /// Queued requests in the order they will start
    pub fn queued_order(&self) -> Vec<RequestId> {
        let mut order = Vec::new();
        let mut cursor = self.head;

        while let Some(id) = cursor {
            let Some(entry) = self.entries.get(&id) else {
                break;
            };
            if entry.state == RequestState::Queued {
                order.push(id);
            }
            cursor = entry.next;
        }

        order
    }

    /// Number of queued, non-cancelled requests
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state == RequestState::Queued)
            .count()
    }

    /// Number of active requests
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Concurrency budget
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Start `id` now if a slot is free, otherwise link it into the list.
    /// Returns `true` if it started.
    fn insert(&mut self, id: RequestId) -> bool {
        if self.active < self.concurrency {
            self.activate(id);
            return true;
        }

        let batch = self.batch;
        match (self.head, self.batch_tail) {
            (None, _) => {
                self.head = Some(id);
                self.batch_tail = Some(id);
            }
            (Some(head), None) => {
                // newest batch jumps ahead of all older pending work
                self.set_links(id, None, Some(head));
                self.set_prev(head, Some(id));
                self.head = Some(id);
                self.batch_tail = Some(id);
            }
            (Some(_), Some(tail)) => {
                let after = self.entries.get(&tail).and_then(|entry| entry.next);
                self.set_links(id, Some(tail), after);
                self.set_next(tail, Some(id));
                if let Some(after) = after {
                    self.set_prev(after, Some(id));
                }
                self.batch_tail = Some(id);
            }
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.batch = batch;
        }
        false
    }

    fn unlink(&mut self, id: RequestId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let prev = entry.prev.take();
        let next = entry.next.take();

        if self.head == Some(id) {
            self.head = next;
        }
        if self.batch_tail == Some(id) {
            self.batch_tail = prev;
        }
        if let Some(next) = next {
            self.set_prev(next, prev);
        }
        if let Some(prev) = prev {
            self.set_next(prev, next);
        }
    }

    fn activate(&mut self, id: RequestId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        self.active += 1;
        entry.state = RequestState::Active;
        entry.status.send_replace(RequestStatus::Active {
            transport: entry.transport,
            progress: Progress::default(),
        });

        self.ready.push(Activation {
            id,
            url: entry.url.clone(),
            cancel: entry.cancel.clone(),
            status: entry.status.clone(),
        });
    }

    fn schedule_next(&mut self) {
        while self.active < self.concurrency {
            let Some(head) = self.head else {
                break;
            };

            let state = self.state(head);
            self.unlink(head);

            if state == Some(RequestState::Queued) {
                self.activate(head);
            } else {
                // cancelled while queued
                self.entries.remove(&head);
            }
        }
    }

    fn set_links(&mut self, id: RequestId, prev: Option<RequestId>, next: Option<RequestId>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.prev = prev;
            entry.next = next;
        }
    }

    fn set_next(&mut self, id: RequestId, next: Option<RequestId>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.next = next;
        }
    }

    fn set_prev(&mut self, id: RequestId, prev: Option<RequestId>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.prev = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn enqueue_id(queue: &mut PriorityQueue, url: &str) -> RequestId {
        queue.enqueue(url).handle.id()
    }

    /// Finish `id` successfully and return what got activated in its place
    fn finish_ok(queue: &mut PriorityQueue, id: RequestId) -> Vec<RequestId> {
        assert!(queue.finish(id, Ok(Bytes::from_static(b"img"))));
        queue.take_activations().iter().map(Activation::id).collect()
    }

    /// Occupy every slot so later enqueues stay queued
    fn saturate(queue: &mut PriorityQueue) -> Vec<RequestId> {
        let ids = (0..queue.concurrency())
            .map(|n| enqueue_id(queue, &format!("blocker-{n}")))
            .collect();
        queue.take_activations();
        ids
    }

    #[test]
    fn test_starts_immediately_under_budget() {
        let mut queue = PriorityQueue::new(2);

        let a = queue.enqueue("a.jpg");
        let b = queue.enqueue("b.jpg");
        let c = queue.enqueue("c.jpg");

        assert_eq!(a.disposition, Disposition::Started);
        assert_eq!(b.disposition, Disposition::Started);
        assert_eq!(c.disposition, Disposition::Queued);
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.pending_count(), 1);

        let started: Vec<_> = queue.take_activations().iter().map(Activation::id).collect();
        assert_eq!(started, vec![a.handle.id(), b.handle.id()]);
        assert!(matches!(a.handle.status(), RequestStatus::Active { .. }));
        assert!(matches!(c.handle.status(), RequestStatus::Queued));
    }

    #[test]
    fn test_newer_batch_is_served_first() {
        let mut queue = PriorityQueue::new(1);
        let blocker = saturate(&mut queue)[0];

        let a = enqueue_id(&mut queue, "a");
        let b = enqueue_id(&mut queue, "b");
        queue.open_new_batch();
        let c = enqueue_id(&mut queue, "c");
        let d = enqueue_id(&mut queue, "d");

        assert_eq!(queue.queued_order(), vec![c, d, a, b]);

        let mut started = Vec::new();
        let mut current = blocker;
        for _ in 0..4 {
            let next = finish_ok(&mut queue, current);
            assert_eq!(next.len(), 1);
            current = next[0];
            started.push(current);
        }

        assert_eq!(started, vec![c, d, a, b]);
        assert!(finish_ok(&mut queue, current).is_empty());
        assert_eq!(queue.active_count(), 0);
    }

    #[test]
    fn test_fifo_within_batch() {
        let mut queue = PriorityQueue::new(1);
        let blocker = saturate(&mut queue)[0];

        let ids: Vec<_> = (0..6)
            .map(|n| enqueue_id(&mut queue, &format!("page-{n}.jpg")))
            .collect();
        assert_eq!(queue.queued_order(), ids);

        let mut started = Vec::new();
        let mut current = blocker;
        while let Some(&next) = finish_ok(&mut queue, current).first() {
            started.push(next);
            current = next;
        }

        assert_eq!(started, ids);
    }

    #[test]
    fn test_batches_stack() {
        let mut queue = PriorityQueue::new(1);
        saturate(&mut queue);

        let a = enqueue_id(&mut queue, "a");
        let first = queue.batch();
        let second = queue.open_new_batch();
        let b = enqueue_id(&mut queue, "b");
        queue.open_new_batch();
        let c = enqueue_id(&mut queue, "c");

        assert!(second > first);
        assert_eq!(queue.batch_of(a), Some(first));
        assert_eq!(queue.batch_of(b), Some(second));
        assert_eq!(queue.queued_order(), vec![c, b, a]);
    }

    #[test]
    fn test_duplicate_url_joins_active_request() {
        let mut queue = PriorityQueue::new(1);

        let first = queue.enqueue("same.jpg");
        let second = queue.enqueue("same.jpg");

        assert_eq!(first.disposition, Disposition::Started);
        assert_eq!(second.disposition, Disposition::Joined);
        assert_eq!(first.handle.id(), second.handle.id());
        assert_eq!(queue.take_activations().len(), 1);
        assert_eq!(queue.active_count(), 1);
    }

    #[test]
    fn test_duplicate_url_promotes_queued_request() {
        let mut queue = PriorityQueue::new(1);
        saturate(&mut queue);

        let a = enqueue_id(&mut queue, "a");
        let b = enqueue_id(&mut queue, "b");
        queue.open_new_batch();
        let c = enqueue_id(&mut queue, "c");

        let again = queue.enqueue("b");
        assert_eq!(again.disposition, Disposition::Promoted);
        assert_eq!(again.handle.id(), b);
        assert_eq!(queue.queued_order(), vec![c, b, a]);
        assert_eq!(queue.batch_of(b), Some(queue.batch()));
    }

    #[test]
    fn test_promote_into_closed_batch_opens_new_front() {
        let mut queue = PriorityQueue::new(1);
        saturate(&mut queue);

        let a = enqueue_id(&mut queue, "a");
        let b = enqueue_id(&mut queue, "b");
        let c = enqueue_id(&mut queue, "c");
        queue.reset_priority();

        assert!(queue.promote(c));
        assert_eq!(queue.queued_order(), vec![c, a, b]);

        // c is now the tail of the open batch
        let d = enqueue_id(&mut queue, "d");
        assert_eq!(queue.queued_order(), vec![c, d, a, b]);
    }

    #[test]
    fn test_promote_only_applies_to_queued() {
        let mut queue = PriorityQueue::new(1);
        let active = enqueue_id(&mut queue, "active");
        assert!(!queue.promote(active));
        assert!(!queue.promote(RequestId(999)));
    }

    #[test]
    fn test_promote_within_open_batch_moves_to_tail() {
        let mut queue = PriorityQueue::new(1);
        saturate(&mut queue);

        let a = enqueue_id(&mut queue, "a");
        let b = enqueue_id(&mut queue, "b");

        assert!(queue.promote(a));
        assert_eq!(queue.queued_order(), vec![b, a]);

        let c = enqueue_id(&mut queue, "c");
        assert_eq!(queue.queued_order(), vec![b, a, c]);
    }

    #[test]
    fn test_activating_last_node_clears_cursors() {
        let mut queue = PriorityQueue::new(1);
        let blocker = saturate(&mut queue)[0];

        // a is both head and batch tail
        let a = enqueue_id(&mut queue, "a");
        assert_eq!(finish_ok(&mut queue, blocker), vec![a]);
        assert!(queue.queued_order().is_empty());

        let b = enqueue_id(&mut queue, "b");
        let c = enqueue_id(&mut queue, "c");
        queue.open_new_batch();
        let d = enqueue_id(&mut queue, "d");

        assert_eq!(queue.queued_order(), vec![d, b, c]);
    }

    #[test]
    fn test_cancel_queued_is_lazy_and_skipped() {
        let mut queue = PriorityQueue::new(1);
        let blocker = saturate(&mut queue)[0];

        let a = queue.enqueue("a");
        let b = enqueue_id(&mut queue, "b");

        assert!(queue.cancel(a.handle.id()));
        assert!(matches!(a.handle.status(), RequestStatus::Cancelled));
        assert_eq!(queue.state(a.handle.id()), Some(RequestState::Cancelled));
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.queued_order(), vec![b]);

        assert_eq!(finish_ok(&mut queue, blocker), vec![b]);
        assert_eq!(queue.state(a.handle.id()), None);
    }

    #[test]
    fn test_cancelled_url_can_be_requested_again() {
        let mut queue = PriorityQueue::new(1);
        saturate(&mut queue);

        let first = enqueue_id(&mut queue, "a");
        queue.cancel(first);

        let second = queue.enqueue("a");
        assert_eq!(second.disposition, Disposition::Queued);
        assert_ne!(second.handle.id(), first);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut queue = PriorityQueue::new(1);
        let active = enqueue_id(&mut queue, "active");
        let queued = enqueue_id(&mut queue, "queued");
        queue.take_activations();

        assert!(queue.cancel(queued));
        assert!(!queue.cancel(queued));

        assert!(queue.cancel(active));
        assert!(!queue.cancel(active));
        assert_eq!(queue.active_count(), 1);

        // the transport unwinds once; the slot is released once
        assert!(queue.finish(active, Err(TransferError::Cancelled)));
        assert!(!queue.finish(active, Err(TransferError::Cancelled)));
        assert_eq!(queue.active_count(), 0);
        assert!(!queue.cancel(active));
        assert!(queue.take_activations().is_empty());
    }

    #[test]
    fn test_cancel_active_signals_token() {
        let mut queue = PriorityQueue::new(1);
        let id = enqueue_id(&mut queue, "a");
        let activation = queue.take_activations().remove(0);

        assert!(queue.cancel(id));
        assert!(activation.cancel_token().is_cancelled());
        assert_eq!(queue.state(id), Some(RequestState::Active));
    }

    #[test]
    fn test_request_after_active_cancel_starts_fresh() {
        let mut queue = PriorityQueue::new(2);
        let doomed = enqueue_id(&mut queue, "screen.jpg");
        assert!(queue.cancel(doomed));

        // the cancelled transfer has not unwound yet
        let fresh = queue.enqueue("screen.jpg");
        assert_ne!(fresh.handle.id(), doomed);
        assert_eq!(fresh.disposition, Disposition::Started);
        assert_eq!(queue.active_count(), 2);

        assert!(queue.finish(doomed, Err(TransferError::Cancelled)));
        let joined = queue.enqueue("screen.jpg");
        assert_eq!(joined.handle.id(), fresh.handle.id());
        assert_eq!(joined.disposition, Disposition::Joined);
    }

    #[test]
    fn test_finish_publishes_outcome() {
        let mut queue = PriorityQueue::new(2);
        let ok = queue.enqueue("ok");
        let failed = queue.enqueue("failed");

        queue.finish(ok.handle.id(), Ok(Bytes::from_static(b"data")));
        queue.finish(
            failed.handle.id(),
            Err(TransportError::Http { status: 404 }.into()),
        );

        assert!(matches!(ok.handle.status(), RequestStatus::Complete(_)));
        assert!(matches!(failed.handle.status(), RequestStatus::Failed(_)));
        assert!(queue.handle(ok.handle.id()).is_none());

        // terminal requests leave the registry; the URL starts fresh
        let again = queue.enqueue("ok");
        assert_ne!(again.handle.id(), ok.handle.id());
    }

    #[test]
    fn test_concurrency_bound_under_random_interleavings() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let concurrency = rng.gen_range(1..4);
            let mut queue = PriorityQueue::new(concurrency);
            let mut active: Vec<RequestId> = Vec::new();
            let mut known: Vec<RequestId> = Vec::new();

            for _ in 0..200 {
                match rng.gen_range(0..5) {
                    0 | 1 => {
                        let url = format!("u{}", rng.gen_range(0..20));
                        known.push(queue.enqueue(&url).handle.id());
                    }
                    2 => queue.reset_priority(),
                    3 if !known.is_empty() => {
                        let id = known[rng.gen_range(0..known.len())];
                        queue.cancel(id);
                    }
                    _ if !active.is_empty() => {
                        let id = active.remove(rng.gen_range(0..active.len()));
                        let outcome = if queue.state(id).is_some() && rng.gen_bool(0.5) {
                            Ok(Bytes::new())
                        } else {
                            Err(TransferError::Cancelled)
                        };
                        queue.finish(id, outcome);
                    }
                    _ => {}
                }

                active.extend(queue.take_activations().iter().map(Activation::id));
                assert!(queue.active_count() <= concurrency);
                assert_eq!(queue.active_count(), active.len());
                if queue.active_count() < concurrency {
                    assert_eq!(queue.pending_count(), 0);
                }
            }
        }
    }
}
