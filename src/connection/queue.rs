//! Serialized request queue
//!
//! Holds at most one in-flight request plus an insertion-ordered waiting
//! list. The queue only tracks ownership; the connection task decides when
//! a request starts and when it reaches a terminal state.

use std::collections::VecDeque;

use super::request::{Request, RequestKind};

struct Slot {
    request: Request,
    seq: u64,
    started: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// The request took the empty in-flight slot.
    Current,
    /// The request is waiting behind the in-flight one.
    Waiting,
}

#[derive(Default)]
pub struct RequestQueue {
    waiting: VecDeque<Request>,
    current: Option<Slot>,
    next_seq: u64,
    released: bool,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request. A released queue hands it straight back.
    pub fn enqueue(&mut self, request: Request) -> Result<Enqueued, Request> {
        if self.released {
            return Err(request);
        }
        if self.current.is_none() {
            self.install(request);
            Ok(Enqueued::Current)
        } else {
            self.waiting.push_back(request);
            Ok(Enqueued::Waiting)
        }
    }

    fn install(&mut self, request: Request) {
        self.next_seq += 1;
        self.current = Some(Slot {
            request,
            seq: self.next_seq,
            started: false,
        });
    }

    /// Mark the in-flight request as dispatched and return its sequence
    /// number, unless it was already started.
    pub fn start_current(&mut self) -> Option<u64> {
        match self.current.as_mut() {
            Some(slot) if !slot.started => {
                slot.started = true;
                Some(slot.seq)
            }
            _ => None,
        }
    }

    pub fn current(&self) -> Option<&Request> {
        self.current.as_ref().map(|slot| &slot.request)
    }

    /// Sequence number of the in-flight request. Changes every time the
    /// slot is refilled, so stale timers can be told apart.
    pub fn current_seq(&self) -> Option<u64> {
        self.current.as_ref().map(|slot| slot.seq)
    }

    pub fn is_current(&self, seq: u64) -> bool {
        self.current_seq() == Some(seq)
    }

    /// Remove the in-flight request after it reached a terminal state and
    /// promote the oldest waiting one.
    pub fn finish_current(&mut self) -> Option<Request> {
        let finished = self.current.take().map(|slot| slot.request);
        self.promote();
        finished
    }

    fn promote(&mut self) {
        if self.current.is_none() {
            if let Some(next) = self.waiting.pop_front() {
                self.install(next);
            }
        }
    }

    /// Take every request out of the queue: waiting ones in insertion
    /// order, then the in-flight one.
    pub fn drain_all(&mut self) -> Vec<Request> {
        let mut drained: Vec<Request> = self.waiting.drain(..).collect();
        if let Some(slot) = self.current.take() {
            drained.push(slot.request);
        }
        drained
    }

    /// Drop matching requests without reporting them. Returns how many were
    /// removed and whether the in-flight one was among them.
    pub fn cancel_by_kind(&mut self, kind: RequestKind) -> (usize, bool) {
        let before = self.waiting.len();
        self.waiting.retain(|request| request.kind() != kind);
        let mut removed = before - self.waiting.len();
        let current_removed = matches!(&self.current, Some(slot) if slot.request.kind() == kind);
        if current_removed {
            self.current = None;
            removed += 1;
            self.promote();
        }
        (removed, current_removed)
    }

    /// Drop everything without reporting it.
    pub fn clear(&mut self) {
        self.waiting.clear();
        self.current = None;
    }

    /// Refuse all future requests and hand back the ones still queued.
    pub fn release(&mut self) -> Vec<Request> {
        self.released = true;
        self.drain_all()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
