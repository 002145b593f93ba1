//! Request and reply handles given to service callbacks.
//!
//! A worker answers a `Request` in one of three ways:
//!
//! - directly, with [`Request::reply`] or [`Request::fail`], before returning;
//! - later, by turning it into a [`ReplyToken`] with [`Request::defer`] and
//!   answering from any task or thread once;
//! - later, through a [`ReplyContext`] from [`Request::defer_with_context`],
//!   which can also push any number of pulses tagged with the request's id.
//!
//! Every path re-checks that the message id is still awaiting a reply on a
//! live OSB, so replying after the client left, or twice, is a silent
//! `Discarded`. A GET or PUTGET dropped without an answer is sent
//! `BROKEN_REPLY`; an acknowledged PUT dropped without an answer is acked.

use super::dispatch::ServerCore;
use crate::error::status;
use crate::message::{MessageHeader, MsgFlags, MsgId, MsgType, ObjectRef};
use bytes::Bytes;
use std::sync::Weak;
use tracing::debug;

/// Whether a reply or pulse reached a live OSB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Delivered,
    /// The message id was no longer awaiting, or the OSB or its peer is gone.
    Discarded,
}

impl ReplyOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ReplyOutcome::Delivered)
    }
}

fn deliver(
    core: &Weak<ServerCore>,
    object: ObjectRef,
    msg_id: MsgId,
    code: i32,
    payload: Bytes,
    reply_cap: usize,
) -> ReplyOutcome {
    match core.upgrade() {
        Some(core) => core.deliver_reply(object, msg_id, code, payload, reply_cap),
        None => ReplyOutcome::Discarded,
    }
}

/// A PUT, GET or PUTGET delivered to a worker.
pub struct Request {
    header: MessageHeader,
    payload: Bytes,
    object: ObjectRef,
    core: Weak<ServerCore>,
    answered: bool,
}

impl Request {
    pub(crate) fn new(
        header: MessageHeader,
        payload: Bytes,
        object: ObjectRef,
        core: Weak<ServerCore>,
    ) -> Self {
        Self {
            header,
            payload,
            object,
            core,
            answered: false,
        }
    }

    pub fn kind(&self) -> MsgType {
        self.header.kind
    }

    pub fn msg_id(&self) -> MsgId {
        self.header.msg_id
    }

    pub fn flags(&self) -> MsgFlags {
        self.header.flags
    }

    /// Opaque reference the client passed with a GET.
    pub fn handle_ref(&self) -> u64 {
        self.header.handle_ref
    }

    /// Bytes the client will accept in the reply.
    pub fn reply_cap(&self) -> usize {
        self.header.reply_cap as usize
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn expects_reply(&self) -> bool {
        self.header.kind.expects_reply(self.header.flags)
    }

    /// Answer with status OK.
    pub fn reply(mut self, payload: impl Into<Bytes>) -> ReplyOutcome {
        self.answer(status::OK, payload.into())
    }

    /// Answer with an error status and no payload.
    pub fn fail(mut self, code: i32) -> ReplyOutcome {
        self.answer(code, Bytes::new())
    }

    pub fn reply_status(mut self, code: i32, payload: impl Into<Bytes>) -> ReplyOutcome {
        self.answer(code, payload.into())
    }

    /// Keep the request open past the callback; answer once with the token.
    pub fn defer(mut self) -> ReplyToken {
        self.answered = true;
        ReplyToken {
            object: self.object,
            msg_id: self.header.msg_id,
            reply_cap: self.reply_cap(),
            core: std::mem::take(&mut self.core),
            answered: !self.expects_reply(),
        }
    }

    /// Keep the request open past the callback with a context that can
    /// also send pulses tagged with this request's id.
    pub fn defer_with_context(mut self) -> ReplyContext {
        self.answered = true;
        ReplyContext {
            header: self.header.clone(),
            object: self.object,
            core: std::mem::take(&mut self.core),
            replied: !self.expects_reply(),
        }
    }

    /// Pulse sender bound to this request's OSB.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            object: self.object,
            core: self.core.clone(),
        }
    }

    fn answer(&mut self, code: i32, payload: Bytes) -> ReplyOutcome {
        self.answered = true;
        if self.expects_reply() {
            return deliver(
                &self.core,
                self.object,
                self.header.msg_id,
                code,
                payload,
                self.reply_cap(),
            );
        }
        // Nobody waits on a plain PUT; only failures are worth telling the client.
        if code == status::OK {
            return ReplyOutcome::Discarded;
        }
        match self.core.upgrade() {
            Some(core) => core.send_unsolicited(self.object, self.header.msg_id, code, payload),
            None => ReplyOutcome::Discarded,
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.answered || !self.expects_reply() {
            return;
        }
        if self.header.kind == MsgType::Put {
            self.answer(status::OK, Bytes::new());
        } else {
            debug!(
                "{} #{} on {} dropped without a reply",
                self.header.kind, self.header.msg_id, self.object
            );
            self.answer(status::BROKEN_REPLY, Bytes::new());
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.header.kind)
            .field("msg_id", &self.header.msg_id)
            .field("object", &self.object)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Deferred-by-id reply handle.
///
/// Answers exactly once. Dropping it unanswered sends `BROKEN_REPLY`.
pub struct ReplyToken {
    object: ObjectRef,
    msg_id: MsgId,
    reply_cap: usize,
    core: Weak<ServerCore>,
    answered: bool,
}

impl ReplyToken {
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn msg_id(&self) -> MsgId {
        self.msg_id
    }

    /// Whether the client is still waiting on this id.
    pub fn is_pending(&self) -> bool {
        !self.answered
            && self
                .core
                .upgrade()
                .is_some_and(|core| core.is_awaiting(self.object, self.msg_id))
    }

    pub fn reply(self, payload: impl Into<Bytes>) -> ReplyOutcome {
        self.reply_status(status::OK, payload)
    }

    pub fn fail(self, code: i32) -> ReplyOutcome {
        self.reply_status(code, Bytes::new())
    }

    pub fn reply_status(mut self, code: i32, payload: impl Into<Bytes>) -> ReplyOutcome {
        if self.answered {
            return ReplyOutcome::Discarded;
        }
        self.answered = true;
        deliver(
            &self.core,
            self.object,
            self.msg_id,
            code,
            payload.into(),
            self.reply_cap,
        )
    }
}

impl Drop for ReplyToken {
    fn drop(&mut self) {
        if !self.answered {
            self.answered = true;
            deliver(
                &self.core,
                self.object,
                self.msg_id,
                status::BROKEN_REPLY,
                Bytes::new(),
                self.reply_cap,
            );
        }
    }
}

impl std::fmt::Debug for ReplyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyToken")
            .field("object", &self.object)
            .field("msg_id", &self.msg_id)
            .field("answered", &self.answered)
            .finish()
    }
}

/// Deferred-with-context reply handle.
///
/// Carries the full request header, so it can answer the request once and
/// also stream any number of pulses tagged with the request's id.
pub struct ReplyContext {
    header: MessageHeader,
    object: ObjectRef,
    core: Weak<ServerCore>,
    replied: bool,
}

impl ReplyContext {
    pub fn kind(&self) -> MsgType {
        self.header.kind
    }

    pub fn msg_id(&self) -> MsgId {
        self.header.msg_id
    }

    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn handle_ref(&self) -> u64 {
        self.header.handle_ref
    }

    pub fn reply_cap(&self) -> usize {
        self.header.reply_cap as usize
    }

    /// Whether the OSB this context belongs to is still open.
    pub fn is_live(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.osb_link(self.object).is_some())
    }

    /// Answer the request. Only the first answer counts.
    pub fn reply(&mut self, payload: impl Into<Bytes>) -> ReplyOutcome {
        self.reply_status(status::OK, payload)
    }

    pub fn fail(&mut self, code: i32) -> ReplyOutcome {
        self.reply_status(code, Bytes::new())
    }

    pub fn reply_status(&mut self, code: i32, payload: impl Into<Bytes>) -> ReplyOutcome {
        if self.replied {
            return ReplyOutcome::Discarded;
        }
        self.replied = true;
        deliver(
            &self.core,
            self.object,
            self.header.msg_id,
            code,
            payload.into(),
            self.reply_cap(),
        )
    }

    /// Push a pulse tagged with this request's id.
    pub fn pulse(&self, code: i32, value: u64, payload: impl Into<Bytes>) -> ReplyOutcome {
        match self.core.upgrade() {
            Some(core) => core.deliver_pulse(
                self.object,
                Some(self.header.msg_id),
                code,
                value,
                payload.into(),
            ),
            None => ReplyOutcome::Discarded,
        }
    }
}

impl Drop for ReplyContext {
    fn drop(&mut self) {
        if !self.replied {
            self.replied = true;
            deliver(
                &self.core,
                self.object,
                self.header.msg_id,
                status::BROKEN_REPLY,
                Bytes::new(),
                self.reply_cap(),
            );
        }
    }
}

impl std::fmt::Debug for ReplyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyContext")
            .field("kind", &self.header.kind)
            .field("msg_id", &self.header.msg_id)
            .field("object", &self.object)
            .field("replied", &self.replied)
            .finish()
    }
}

/// Sends untagged pulses to one OSB. Cheap to clone and keep.
#[derive(Clone)]
pub struct Notifier {
    object: ObjectRef,
    core: Weak<ServerCore>,
}

impl Notifier {
    pub(crate) fn new(object: ObjectRef, core: Weak<ServerCore>) -> Self {
        Self { object, core }
    }

    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn is_live(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.osb_link(self.object).is_some())
    }

    pub fn pulse(&self, code: i32, value: u64, payload: impl Into<Bytes>) -> ReplyOutcome {
        match self.core.upgrade() {
            Some(core) => core.deliver_pulse(self.object, None, code, value, payload.into()),
            None => ReplyOutcome::Discarded,
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").field("object", &self.object).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan(kind: MsgType) -> Request {
        let mut header = MessageHeader::new(kind, 0, 3);
        header.reply_cap = 8;
        Request::new(
            header,
            Bytes::from_static(b"data"),
            ObjectRef {
                slot: 0,
                generation: 0,
            },
            Weak::new(),
        )
    }

    #[test]
    fn test_reply_without_server_is_discarded() {
        assert_eq!(orphan(MsgType::Get).reply("x"), ReplyOutcome::Discarded);
    }

    #[test]
    fn test_token_keeps_request_identity() {
        let request = orphan(MsgType::PutGet);
        assert_eq!(request.payload().as_ref(), b"data");
        let token = request.defer();
        assert_eq!(token.msg_id(), 3);
        assert!(!token.is_pending());
        assert_eq!(token.reply("late"), ReplyOutcome::Discarded);
    }

    #[test]
    fn test_context_answers_once() {
        let mut ctx = orphan(MsgType::Get).defer_with_context();
        assert_eq!(ctx.reply_cap(), 8);
        ctx.reply("first");
        assert_eq!(ctx.reply("second"), ReplyOutcome::Discarded);
        assert!(!ctx.is_live());
        assert_eq!(ctx.pulse(1, 2, Bytes::new()), ReplyOutcome::Discarded);
    }

    #[test]
    fn test_plain_put_expects_no_reply() {
        let request = orphan(MsgType::Put);
        assert!(!request.expects_reply());
        assert_eq!(request.notifier().pulse(1, 1, Bytes::new()), ReplyOutcome::Discarded);
    }
}
