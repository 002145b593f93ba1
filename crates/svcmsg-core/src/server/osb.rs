//! Per-connection server state (OSBs).
//!
//! Slots live in an arena and are addressed by generation-checked
//! `ObjectRef`s. Each slot has its own short-held lock. No lock here is ever
//! held across a service callback, and user data is handed back to the caller
//! on release so it is dropped outside the lock.
//!
//! Lifecycle: `Created -> Open -> Closing -> Released`. A released slot goes
//! back on the free list with its generation bumped, so every reference to
//! the previous occupant stops resolving.

use super::descriptor::{ReleasePolicy, ServiceId, SessionBox};
use super::dispatch::Link;
use crate::error::status;
use crate::message::{MessageHeader, MsgId, ObjectRef};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Lock a std mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Slot reserved while the open callback runs.
    Created,
    Open,
    /// Close callback started; waiting for in-flight work to drain.
    Closing,
    Released,
}

/// Point-in-time view of one OSB, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsbSnapshot {
    pub object: ObjectRef,
    pub service: Option<ServiceId>,
    pub lifecycle: LifecycleState,
    pub in_use: usize,
    pub close_requested: bool,
    pub awaiting: usize,
}

struct OsbState {
    generation: u32,
    lifecycle: LifecycleState,
    service: Option<ServiceId>,
    session: Option<SessionBox>,
    link: Option<Arc<Link>>,
    /// Callbacks currently running against this OSB.
    in_use: usize,
    close_requested: bool,
    /// Message ids received and not yet answered.
    awaiting: HashSet<MsgId>,
    max_pending: usize,
}

impl Default for OsbState {
    fn default() -> Self {
        Self {
            generation: 0,
            lifecycle: LifecycleState::Released,
            service: None,
            session: None,
            link: None,
            in_use: 0,
            close_requested: false,
            awaiting: HashSet::new(),
            max_pending: 0,
        }
    }
}

impl OsbState {
    fn drained(&self) -> bool {
        self.in_use == 0 && self.awaiting.is_empty()
    }

    fn release(&mut self, slot: u32) -> Released {
        let released = Released {
            object: ObjectRef {
                slot,
                generation: self.generation,
            },
            service: self.service.take(),
            session: self.session.take(),
            link: self.link.take(),
        };
        self.lifecycle = LifecycleState::Released;
        self.generation = self.generation.wrapping_add(1);
        self.in_use = 0;
        self.close_requested = false;
        self.awaiting.clear();
        released
    }
}

#[derive(Default)]
struct OsbSlot {
    state: Mutex<OsbState>,
}

/// What a release hands back. Drop it outside any arena lock.
pub(crate) struct Released {
    pub object: ObjectRef,
    pub service: Option<ServiceId>,
    pub session: Option<SessionBox>,
    pub link: Option<Arc<Link>>,
}

/// Arena of OSB slots.
#[derive(Default)]
pub(crate) struct OsbArena {
    slots: RwLock<Vec<Arc<OsbSlot>>>,
    free: Mutex<Vec<u32>>,
}

impl OsbArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, index: u32) -> Option<Arc<OsbSlot>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(index as usize).cloned()
    }

    /// Run `f` on the slot's state if `obj` still names its current occupant.
    fn with_state<R>(&self, obj: ObjectRef, f: impl FnOnce(&mut OsbState) -> R) -> Option<R> {
        let slot = self.slot(obj.slot)?;
        let mut state = lock(&slot.state);
        if state.generation != obj.generation || state.lifecycle == LifecycleState::Released {
            return None;
        }
        Some(f(&mut state))
    }

    fn recycle(&self, released: &Option<Released>) {
        if let Some(r) = released {
            lock(&self.free).push(r.object.slot);
        }
    }

    /// Reserve a slot for an OPEN in progress.
    pub fn create(&self, service: ServiceId, link: Arc<Link>, max_pending: usize) -> ObjectRef {
        let reused = lock(&self.free).pop();
        let (index, slot) = match reused.and_then(|i| self.slot(i).map(|s| (i, s))) {
            Some(found) => found,
            None => {
                let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
                let slot = Arc::new(OsbSlot::default());
                slots.push(slot.clone());
                ((slots.len() - 1) as u32, slot)
            }
        };

        let mut state = lock(&slot.state);
        state.lifecycle = LifecycleState::Created;
        state.service = Some(service);
        state.link = Some(link);
        state.max_pending = max_pending;
        state.in_use = 0;
        state.close_requested = false;
        state.awaiting.clear();
        ObjectRef {
            slot: index,
            generation: state.generation,
        }
    }

    /// Attach the session created by the open callback and make the OSB visible.
    pub fn activate(&self, obj: ObjectRef, session: SessionBox) -> bool {
        self.with_state(obj, |state| {
            if state.lifecycle != LifecycleState::Created {
                return false;
            }
            state.session = Some(session);
            state.lifecycle = LifecycleState::Open;
            true
        })
        .unwrap_or(false)
    }

    /// Give back a slot whose open callback failed.
    pub fn abort(&self, obj: ObjectRef) -> Option<Released> {
        let released = self
            .with_state(obj, |state| {
                (state.lifecycle == LifecycleState::Created).then(|| state.release(obj.slot))
            })
            .flatten();
        self.recycle(&released);
        released
    }

    /// Admit a message for a callback: mark the OSB in use and, when the
    /// message expects a reply, record its id as awaiting one. Returns the
    /// session the callback runs against.
    pub fn admit(&self, obj: ObjectRef, header: &MessageHeader) -> Result<SessionBox, i32> {
        self.with_state(obj, |state| {
            if state.lifecycle != LifecycleState::Open {
                return Err(status::NO_SUCH_OBJECT);
            }
            let Some(session) = state.session.clone() else {
                return Err(status::INTERNAL);
            };
            if header.kind.expects_reply(header.flags) {
                if state.awaiting.len() >= state.max_pending {
                    return Err(status::BUSY);
                }
                if !state.awaiting.insert(header.msg_id) {
                    return Err(status::DUPLICATE_MSG_ID);
                }
            }
            state.in_use += 1;
            Ok(session)
        })
        .unwrap_or(Err(status::NO_SUCH_OBJECT))
    }

    /// A callback admitted with `admit` returned.
    pub fn complete(&self, obj: ObjectRef) -> Option<Released> {
        let released = self
            .with_state(obj, |state| {
                state.in_use = state.in_use.saturating_sub(1);
                (state.lifecycle == LifecycleState::Closing && state.drained())
                    .then(|| state.release(obj.slot))
            })
            .flatten();
        self.recycle(&released);
        released
    }

    /// Start closing an open OSB. `None` if it is already closing or gone.
    pub fn begin_close(&self, obj: ObjectRef) -> Option<SessionBox> {
        self.with_state(obj, |state| {
            if state.lifecycle != LifecycleState::Open {
                return None;
            }
            state.lifecycle = LifecycleState::Closing;
            state.close_requested = true;
            state.in_use += 1;
            state.session.clone()
        })
        .flatten()
    }

    /// The close callback returned; release according to `policy`.
    pub fn finish_close(&self, obj: ObjectRef, policy: ReleasePolicy) -> Option<Released> {
        let released = self
            .with_state(obj, |state| {
                state.in_use = state.in_use.saturating_sub(1);
                match policy {
                    ReleasePolicy::Immediate => Some(state.release(obj.slot)),
                    ReleasePolicy::Deferred => state.drained().then(|| state.release(obj.slot)),
                }
            })
            .flatten();
        self.recycle(&released);
        released
    }

    /// Take `msg_id` out of the awaiting set so a reply can be sent.
    ///
    /// Returns the link to send on, or `None` when the id is not awaiting
    /// (already answered, never tracked, or the OSB is gone). A closing OSB
    /// whose last reply this was is released.
    pub fn claim_reply(
        &self,
        obj: ObjectRef,
        msg_id: MsgId,
    ) -> (Option<Arc<Link>>, Option<Released>) {
        let result = self.with_state(obj, |state| {
            if !state.awaiting.remove(&msg_id) {
                return (None, None);
            }
            let link = state.link.clone();
            let released = (state.lifecycle == LifecycleState::Closing && state.drained())
                .then(|| state.release(obj.slot));
            (link, released)
        });
        let (link, released) = result.unwrap_or((None, None));
        self.recycle(&released);
        (link, released)
    }

    pub fn is_awaiting(&self, obj: ObjectRef, msg_id: MsgId) -> bool {
        self.with_state(obj, |state| state.awaiting.contains(&msg_id))
            .unwrap_or(false)
    }

    /// Link of an open OSB, for pulses.
    pub fn link_for(&self, obj: ObjectRef) -> Option<Arc<Link>> {
        self.with_state(obj, |state| {
            (state.lifecycle == LifecycleState::Open)
                .then(|| state.link.clone())
                .flatten()
        })
        .flatten()
    }

    pub fn snapshot(&self, obj: ObjectRef) -> Option<OsbSnapshot> {
        self.with_state(obj, |state| OsbSnapshot {
            object: obj,
            service: state.service,
            lifecycle: state.lifecycle,
            in_use: state.in_use,
            close_requested: state.close_requested,
            awaiting: state.awaiting.len(),
        })
    }

    /// Slots not on the free list.
    #[cfg(test)]
    pub fn occupied(&self) -> usize {
        let total = self.slots.read().unwrap_or_else(PoisonError::into_inner).len();
        total.saturating_sub(lock(&self.free).len())
    }

    /// Release every occupied slot regardless of state. Used at shutdown.
    pub fn release_all(&self) -> Vec<Released> {
        let slots: Vec<Arc<OsbSlot>> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut released = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            let mut state = lock(&slot.state);
            if state.lifecycle != LifecycleState::Released {
                released.push(state.release(index as u32));
            }
        }
        let mut free = lock(&self.free);
        free.extend(released.iter().map(|r| r.object.slot));
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgFlags, MsgType};

    fn open_osb(arena: &OsbArena, max_pending: usize) -> ObjectRef {
        let obj = arena.create(ServiceId(0), Link::detached(), max_pending);
        assert!(arena.activate(obj, Arc::new(())));
        obj
    }

    fn get(msg_id: MsgId) -> MessageHeader {
        MessageHeader::new(MsgType::Get, 0, msg_id)
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let arena = OsbArena::new();
        let first = open_osb(&arena, 4);
        assert!(arena.begin_close(first).is_some());
        assert!(arena.finish_close(first, ReleasePolicy::Deferred).is_some());

        let second = open_osb(&arena, 4);
        assert_eq!(second.slot, first.slot);
        assert_eq!(second.generation, first.generation + 1);
        assert!(arena.snapshot(first).is_none());
        assert!(arena.snapshot(second).is_some());
    }

    #[test]
    fn test_admit_rejects_duplicate_and_overflow() {
        let arena = OsbArena::new();
        let obj = open_osb(&arena, 2);

        assert!(arena.admit(obj, &get(1)).is_ok());
        assert_eq!(arena.admit(obj, &get(1)).err(), Some(status::DUPLICATE_MSG_ID));
        assert!(arena.admit(obj, &get(2)).is_ok());
        assert_eq!(arena.admit(obj, &get(3)).err(), Some(status::BUSY));

        // A plain PUT is never tracked, so the bound does not apply.
        let put = MessageHeader::new(MsgType::Put, 0, 4);
        assert!(arena.admit(obj, &put).is_ok());
        let mut acked = MessageHeader::new(MsgType::Put, 0, 5);
        acked.flags = MsgFlags::ACK;
        assert_eq!(arena.admit(obj, &acked).err(), Some(status::BUSY));
    }

    #[test]
    fn test_claim_reply_only_once() {
        let arena = OsbArena::new();
        let obj = open_osb(&arena, 4);
        arena.admit(obj, &get(9)).ok();
        arena.complete(obj);

        let (link, released) = arena.claim_reply(obj, 9);
        assert!(link.is_some());
        assert!(released.is_none());
        let (link, _) = arena.claim_reply(obj, 9);
        assert!(link.is_none());
    }

    #[test]
    fn test_deferred_release_waits_for_replies() {
        let arena = OsbArena::new();
        let obj = open_osb(&arena, 4);
        arena.admit(obj, &get(1)).ok();
        arena.complete(obj);

        assert!(arena.begin_close(obj).is_some());
        assert!(arena.finish_close(obj, ReleasePolicy::Deferred).is_none());
        let snap = arena.snapshot(obj).unwrap();
        assert_eq!(snap.lifecycle, LifecycleState::Closing);
        assert!(snap.close_requested);
        assert_eq!(snap.awaiting, 1);

        let (link, released) = arena.claim_reply(obj, 1);
        assert!(link.is_some());
        assert!(released.is_some());
        assert!(arena.snapshot(obj).is_none());
    }

    #[test]
    fn test_immediate_release_discards_late_replies() {
        let arena = OsbArena::new();
        let obj = open_osb(&arena, 4);
        arena.admit(obj, &get(1)).ok();
        arena.complete(obj);

        assert!(arena.begin_close(obj).is_some());
        assert!(arena.finish_close(obj, ReleasePolicy::Immediate).is_some());
        let (link, released) = arena.claim_reply(obj, 1);
        assert!(link.is_none());
        assert!(released.is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let arena = OsbArena::new();
        let obj = open_osb(&arena, 4);
        assert!(arena.begin_close(obj).is_some());
        assert!(arena.begin_close(obj).is_none());
        arena.finish_close(obj, ReleasePolicy::Deferred);
        assert!(arena.begin_close(obj).is_none());
    }

    #[test]
    fn test_abort_frees_created_slot() {
        let arena = OsbArena::new();
        let obj = arena.create(ServiceId(1), Link::detached(), 4);
        assert!(arena.link_for(obj).is_none());
        assert!(arena.abort(obj).is_some());
        assert_eq!(arena.occupied(), 0);
    }

    #[test]
    fn test_release_all() {
        let arena = OsbArena::new();
        open_osb(&arena, 4);
        open_osb(&arena, 4);
        assert_eq!(arena.occupied(), 2);
        assert_eq!(arena.release_all().len(), 2);
        assert_eq!(arena.occupied(), 0);
    }
}
