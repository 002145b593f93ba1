//! Echo service.
//!
//! - PUT stores the payload as the session's last message.
//! - GET with `handle_ref == 0` returns the last stored message.
//! - GET with `handle_ref == n > 0` streams `n` pulses tagged with the
//!   request's id, then replies with the last stored message.
//! - PUTGET answers `ping` with `pong` and echoes anything else.

use crate::message::{MsgType, ObjectRef, PeerCredentials};
use crate::server::{OpenContext, Request, ServiceHandler};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Pulse code used for streamed GET progress.
pub const STREAM_PULSE: i32 = 0x10;

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoService;

#[derive(Debug)]
pub struct EchoSession {
    pub object: ObjectRef,
    pub peer: PeerCredentials,
    last: Mutex<Bytes>,
    requests: AtomicU64,
}

impl EchoSession {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn last(&self) -> Bytes {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, data: Bytes) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = data;
    }
}

#[async_trait]
impl ServiceHandler for EchoService {
    type Session = EchoSession;

    async fn open(&self, ctx: &OpenContext) -> Result<EchoSession, i32> {
        debug!("Echo session {} for PID {}", ctx.object, ctx.credentials.pid);
        Ok(EchoSession {
            object: ctx.object,
            peer: ctx.credentials.clone(),
            last: Mutex::new(ctx.data.clone()),
            requests: AtomicU64::new(0),
        })
    }

    async fn worker(&self, session: Arc<EchoSession>, request: Request) {
        session.requests.fetch_add(1, Ordering::Relaxed);
        match request.kind() {
            MsgType::Put => session.store(request.payload().clone()),
            MsgType::Get if request.handle_ref() == 0 => {
                request.reply(session.last());
            }
            MsgType::Get => {
                let count = request.handle_ref();
                let mut ctx = request.defer_with_context();
                let last = session.last();
                tokio::spawn(async move {
                    for i in 1..=count {
                        if !ctx.pulse(STREAM_PULSE, i, Bytes::new()).is_delivered() {
                            return;
                        }
                    }
                    ctx.reply(last);
                });
            }
            MsgType::PutGet if request.payload().as_ref() == b"ping" => {
                request.reply(Bytes::from_static(b"pong"));
            }
            MsgType::PutGet => {
                let data = request.payload().clone();
                request.reply(data);
            }
            _ => {}
        }
    }
}
