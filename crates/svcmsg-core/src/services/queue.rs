//! Shared FIFO queue service.
//!
//! Every connection sees the same queue. A GET on an empty queue is
//! deferred and answered by the next PUT, oldest waiter first; waiters whose
//! client already gave up are skipped. NOTIFY arms a pulse for when data
//! arrives (`Input`) or room frees up (`Output`).

use crate::message::{MsgType, NotifyKind, NotifyOutcome, NotifyRequest, ObjectRef};
use crate::server::{
    CloseReason, Notifier, OpenContext, ReplyOutcome, ReplyToken, Request, ServiceHandler,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Application status for a PUT on a full queue.
pub const QUEUE_FULL: i32 = 1;

#[derive(Default)]
struct QueueState {
    items: VecDeque<Bytes>,
    waiters: VecDeque<ReplyToken>,
    input_watchers: Vec<(Notifier, i32)>,
    output_watchers: Vec<(Notifier, i32)>,
}

#[derive(Clone)]
pub struct QueueService {
    state: Arc<Mutex<QueueState>>,
    capacity: usize,
}

#[derive(Debug)]
pub struct QueueSession {
    pub object: ObjectRef,
}

impl QueueService {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deferred GETs waiting for data.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Hand `item` to the oldest live waiter, or queue it.
    ///
    /// Returns the resulting depth, or the item back when the queue is full.
    fn push(&self, item: Bytes) -> Result<usize, Bytes> {
        loop {
            let token = {
                let mut state = self.lock();
                match state.waiters.pop_front() {
                    Some(token) => token,
                    None => {
                        if state.items.len() >= self.capacity {
                            return Err(item);
                        }
                        state.items.push_back(item);
                        let depth = state.items.len();
                        let watchers = std::mem::take(&mut state.input_watchers);
                        drop(state);
                        fire(watchers, depth);
                        return Ok(depth);
                    }
                }
            };
            match token.reply(item.clone()) {
                ReplyOutcome::Delivered => return Ok(0),
                ReplyOutcome::Discarded => debug!("Skipping a waiter that is gone"),
            }
        }
    }

    fn pop(&self) -> Option<Bytes> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        let depth = state.items.len();
        let watchers = std::mem::take(&mut state.output_watchers);
        drop(state);
        fire(watchers, depth);
        Some(item)
    }
}

fn fire(watchers: Vec<(Notifier, i32)>, depth: usize) {
    for (notifier, code) in watchers {
        notifier.pulse(code, depth as u64, Bytes::new());
    }
}

#[async_trait]
impl ServiceHandler for QueueService {
    type Session = QueueSession;

    async fn open(&self, ctx: &OpenContext) -> Result<QueueSession, i32> {
        Ok(QueueSession { object: ctx.object })
    }

    async fn worker(&self, _session: Arc<QueueSession>, request: Request) {
        match request.kind() {
            MsgType::Put | MsgType::PutGet => {
                let item = request.payload().clone();
                match self.push(item) {
                    Ok(depth) if request.kind() == MsgType::PutGet => {
                        request.reply(depth.to_string());
                    }
                    Ok(_) => {}
                    Err(_) => {
                        request.fail(QUEUE_FULL);
                    }
                }
            }
            MsgType::Get => match self.pop() {
                Some(item) => {
                    request.reply(item);
                }
                None => {
                    let token = request.defer();
                    // Data may have arrived between the pop and the defer.
                    let mut state = self.lock();
                    match state.items.pop_front() {
                        Some(item) => {
                            drop(state);
                            token.reply(item);
                        }
                        None => state.waiters.push_back(token),
                    }
                }
            },
            _ => {}
        }
    }

    async fn notify(
        &self,
        _session: Arc<QueueSession>,
        request: NotifyRequest,
        notifier: Notifier,
    ) -> Result<NotifyOutcome, i32> {
        let mut state = self.lock();
        let ready = match request.kind {
            NotifyKind::Input => !state.items.is_empty(),
            NotifyKind::Output => state.items.len() < self.capacity,
        };
        if ready {
            return Ok(NotifyOutcome::Ready);
        }
        match request.kind {
            NotifyKind::Input => state.input_watchers.push((notifier, request.code)),
            NotifyKind::Output => state.output_watchers.push((notifier, request.code)),
        }
        Ok(NotifyOutcome::Armed)
    }

    async fn close(&self, session: Arc<QueueSession>, reason: CloseReason) {
        let orphaned: VecDeque<ReplyToken> = {
            let mut state = self.lock();
            let (orphaned, keep) = std::mem::take(&mut state.waiters)
                .into_iter()
                .partition(|token| token.object() == session.object);
            state.waiters = keep;
            state
                .input_watchers
                .retain(|(n, _)| n.object() != session.object);
            state
                .output_watchers
                .retain(|(n, _)| n.object() != session.object);
            orphaned
        };
        if !orphaned.is_empty() {
            debug!(
                "Dropping {} waiting GET(s) of {} ({:?})",
                orphaned.len(),
                session.object,
                reason
            );
        }
    }
}
