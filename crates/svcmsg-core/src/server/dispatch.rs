//! Connection handling and the dispatch loop.
//!
//! Each accepted TCP connection gets a reader task and a writer task. The
//! reader hands request frames to a shared dispatch queue and waits until the
//! frame has been dispatched before reading the next one, so one connection's
//! messages are handled in order while different connections proceed in
//! parallel across the dispatch workers. Everything sent back (replies and
//! pulses) goes through the link's unbounded outbound channel, which makes
//! replying a plain synchronous call from any task or thread.

use super::descriptor::{CloseReason, OpenContext, ServiceDescriptor, ServiceId};
use super::osb::{lock, OsbArena, Released};
use super::permissions::PermissionManager;
use super::reply::{Notifier, ReplyOutcome, Request};
use crate::cancel::CancellationToken;
use crate::config::{IpcConfig, ServiceFlags};
use crate::error::status;
use crate::message::{
    FrameHeader, MessageHeader, MsgFlags, MsgId, MsgType, NotifyRequest, ObjectRef, OpenRequest,
    PulseHeader, ReplyHeader,
};
use crate::protocol::{read_frame, write_frame, Frame};
use crate::SvcError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// One client connection as seen by the server.
pub(crate) struct Link {
    pub id: u64,
    pub peer: SocketAddr,
    tx: mpsc::UnboundedSender<Frame>,
    /// Fired when the peer is gone or the server shuts down.
    pub cancel: CancellationToken,
    binding: Mutex<Option<(ServiceId, ObjectRef)>>,
}

impl Link {
    pub fn new(id: u64, peer: SocketAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            id,
            peer,
            tx,
            cancel: CancellationToken::new(),
            binding: Mutex::new(None),
        });
        (link, rx)
    }

    /// A link whose outbound side goes nowhere.
    #[cfg(test)]
    pub fn detached() -> Arc<Self> {
        let (link, _rx) = Self::new(0, SocketAddr::from(([127, 0, 0, 1], 0)));
        link
    }

    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn bound(&self) -> Option<(ServiceId, ObjectRef)> {
        *lock(&self.binding)
    }

    fn bind(&self, service: ServiceId, object: ObjectRef) {
        *lock(&self.binding) = Some((service, object));
    }

    fn unbind(&self, object: ObjectRef) {
        let mut binding = lock(&self.binding);
        if binding.is_some_and(|(_, bound)| bound == object) {
            *binding = None;
        }
    }
}

/// A request frame waiting for a dispatch worker.
pub(crate) struct Inbound {
    pub link: Arc<Link>,
    pub header: MessageHeader,
    pub payload: Bytes,
    /// Signalled once dispatch returns, releasing the connection's reader.
    pub done: Option<oneshot::Sender<()>>,
}

/// CLOSE injected on behalf of a peer that went away while bound to an OSB.
fn synthetic_close(link: &Arc<Link>) -> Option<Inbound> {
    let (service, object) = link.bound()?;
    let mut header = MessageHeader::new(MsgType::Close, service.0, 0);
    header.flags = MsgFlags::SYNTHETIC;
    header.object = Some(object);
    Some(Inbound {
        link: link.clone(),
        header,
        payload: Bytes::new(),
        done: None,
    })
}

fn truncate(payload: Bytes, cap: usize) -> (Bytes, bool) {
    if payload.len() > cap {
        (payload.slice(..cap), true)
    } else {
        (payload, false)
    }
}

/// Point-in-time server counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub services: usize,
    pub active_osbs: usize,
    pub opened: u64,
    pub released: u64,
    pub discarded_replies: u64,
    pub connections: usize,
    pub live_dispatchers: usize,
}

#[derive(Default)]
struct Counters {
    active_osbs: usize,
    opened: u64,
    released: u64,
    discarded_replies: u64,
}

/// State shared by the accept loop, readers, dispatch workers and reply handles.
pub(crate) struct ServerCore {
    pub services: Vec<ServiceDescriptor>,
    pub osbs: OsbArena,
    permissions: Option<Arc<dyn PermissionManager>>,
    /// Global lock for OSB counts; held only for counter updates.
    counters: Mutex<Counters>,
    pub connections: AtomicUsize,
    pub live_dispatchers: AtomicUsize,
}

impl ServerCore {
    pub fn new(
        services: Vec<ServiceDescriptor>,
        permissions: Option<Arc<dyn PermissionManager>>,
    ) -> Self {
        Self {
            services,
            osbs: OsbArena::new(),
            permissions,
            counters: Mutex::new(Counters::default()),
            connections: AtomicUsize::new(0),
            live_dispatchers: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> ServerStats {
        let counters = lock(&self.counters);
        ServerStats {
            services: self.services.len(),
            active_osbs: counters.active_osbs,
            opened: counters.opened,
            released: counters.released,
            discarded_replies: counters.discarded_replies,
            connections: self.connections.load(Ordering::Relaxed),
            live_dispatchers: self.live_dispatchers.load(Ordering::Relaxed),
        }
    }

    /// Count a new OSB against its service, or report the service's limit.
    fn reserve(&self, service: &ServiceDescriptor) -> Result<(), usize> {
        let mut counters = lock(&self.counters);
        let active = service.active_osbs.load(Ordering::Acquire);
        if active >= service.config.max_osbs {
            return Err(service.config.max_osbs);
        }
        service.active_osbs.store(active + 1, Ordering::Release);
        counters.active_osbs += 1;
        counters.opened += 1;
        Ok(())
    }

    fn on_released(&self, released: Released) {
        let Released {
            object,
            service,
            session,
            link,
        } = released;
        {
            let mut counters = lock(&self.counters);
            counters.active_osbs = counters.active_osbs.saturating_sub(1);
            counters.released += 1;
            if let Some(svc) = service.and_then(|id| self.services.get(id.0 as usize)) {
                let _ = svc.active_osbs.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    n.checked_sub(1)
                });
            }
        }
        // User data goes away here, after every lock is released.
        drop(session);
        match link {
            Some(link) => debug!("Released {} (link {})", object, link.id),
            None => debug!("Released {}", object),
        }
    }

    fn count_discard(&self) {
        lock(&self.counters).discarded_replies += 1;
    }

    /// Release every OSB without running close callbacks.
    pub fn release_all(&self) {
        for released in self.osbs.release_all() {
            self.on_released(released);
        }
    }

    fn send_reply(&self, link: &Link, header: ReplyHeader, payload: Bytes) -> bool {
        link.send(Frame::new(FrameHeader::Reply(header), payload))
    }

    /// Answer a message that never made it to a callback.
    fn reject(&self, link: &Link, msg_id: MsgId, code: i32, message: String) {
        debug!("Rejecting #{} on link {}: {} {}", msg_id, link.id, code, message);
        self.send_reply(
            link,
            ReplyHeader {
                msg_id,
                status: code,
                object: None,
                truncated: false,
            },
            Bytes::from(message),
        );
    }

    pub fn deliver_reply(
        &self,
        object: ObjectRef,
        msg_id: MsgId,
        code: i32,
        payload: Bytes,
        reply_cap: usize,
    ) -> ReplyOutcome {
        let (link, released) = self.osbs.claim_reply(object, msg_id);
        if let Some(released) = released {
            self.on_released(released);
        }
        let Some(link) = link else {
            debug!("Discarding reply to #{} on {}: not awaiting", msg_id, object);
            self.count_discard();
            return ReplyOutcome::Discarded;
        };

        let (payload, truncated) = truncate(payload, reply_cap.min(IpcConfig::MAX_PAYLOAD_SIZE));
        let header = ReplyHeader {
            msg_id,
            status: code,
            object: None,
            truncated,
        };
        if self.send_reply(&link, header, payload) {
            ReplyOutcome::Delivered
        } else {
            self.count_discard();
            ReplyOutcome::Discarded
        }
    }

    /// Error reply for a message that was never tracked (plain PUT).
    pub fn send_unsolicited(
        &self,
        object: ObjectRef,
        msg_id: MsgId,
        code: i32,
        payload: Bytes,
    ) -> ReplyOutcome {
        let Some(link) = self.osbs.link_for(object) else {
            return ReplyOutcome::Discarded;
        };
        let (payload, truncated) = truncate(payload, IpcConfig::MAX_PAYLOAD_SIZE);
        let header = ReplyHeader {
            msg_id,
            status: code,
            object: None,
            truncated,
        };
        if self.send_reply(&link, header, payload) {
            ReplyOutcome::Delivered
        } else {
            ReplyOutcome::Discarded
        }
    }

    pub fn deliver_pulse(
        &self,
        object: ObjectRef,
        msg_id: Option<MsgId>,
        code: i32,
        value: u64,
        payload: Bytes,
    ) -> ReplyOutcome {
        let Some(link) = self.osbs.link_for(object) else {
            trace!("Dropping pulse {} for {}: not open", code, object);
            return ReplyOutcome::Discarded;
        };
        if payload.len() > IpcConfig::MAX_PAYLOAD_SIZE {
            warn!(
                "Dropping pulse {} for {}: payload of {} bytes exceeds {}",
                code,
                object,
                payload.len(),
                IpcConfig::MAX_PAYLOAD_SIZE
            );
            return ReplyOutcome::Discarded;
        }
        let frame = Frame::new(
            FrameHeader::Pulse(PulseHeader {
                code,
                value,
                msg_id,
            }),
            payload,
        );
        if link.send(frame) {
            ReplyOutcome::Delivered
        } else {
            ReplyOutcome::Discarded
        }
    }

    pub fn is_awaiting(&self, object: ObjectRef, msg_id: MsgId) -> bool {
        self.osbs.is_awaiting(object, msg_id)
    }

    pub fn osb_link(&self, object: ObjectRef) -> Option<Arc<Link>> {
        self.osbs.link_for(object)
    }

    /// The OSB this message may address: the one bound to its link.
    fn bound_object(
        &self,
        link: &Link,
        service: &ServiceDescriptor,
        header: &MessageHeader,
    ) -> Result<ObjectRef, i32> {
        match link.bound() {
            Some((id, object)) if id == service.id && header.object == Some(object) => Ok(object),
            _ => Err(status::NO_SUCH_OBJECT),
        }
    }

    fn authorize(&self, service: &ServiceDescriptor, request: &OpenRequest) -> bool {
        if service.config.flags.contains(ServiceFlags::EXTERNAL_PERMISSIONS) {
            match &self.permissions {
                Some(manager) => manager.check(&service.config, &request.credentials, request.flags),
                None => false,
            }
        } else {
            service.handler.authorize(&request.credentials, request.flags)
        }
    }

    /// Route one request frame.
    pub async fn dispatch(self: &Arc<Self>, inbound: Inbound) {
        let Inbound {
            link,
            header,
            payload,
            ..
        } = inbound;

        if header.send_len as usize != payload.len() {
            self.reject(
                &link,
                header.msg_id,
                status::BAD_MESSAGE,
                format!(
                    "send_len {} does not match payload of {} bytes",
                    header.send_len,
                    payload.len()
                ),
            );
            return;
        }

        let Some(service) = self.services.get(header.service_slot as usize) else {
            self.reject(
                &link,
                header.msg_id,
                status::NO_SUCH_SERVICE,
                format!("no service in slot {}", header.service_slot),
            );
            return;
        };

        trace!(
            "Dispatching {} #{} from link {} to {}",
            header.kind,
            header.msg_id,
            link.id,
            service.published_name
        );

        match header.kind {
            MsgType::Open => self.handle_open(&link, service, &header, payload).await,
            MsgType::Close => self.handle_close(&link, service, &header).await,
            MsgType::Notify => self.handle_notify(&link, service, &header, payload).await,
            MsgType::Noop => {
                let open = self
                    .bound_object(&link, service, &header)
                    .ok()
                    .and_then(|object| self.osbs.link_for(object));
                if open.is_none() {
                    self.reject(
                        &link,
                        header.msg_id,
                        status::NO_SUCH_OBJECT,
                        "no open object".to_string(),
                    );
                }
            }
            kind if kind.is_io() => self.handle_io(&link, service, &header, payload).await,
            kind => {
                error!("No route for {} #{}", kind, header.msg_id);
                self.reject(&link, header.msg_id, status::INTERNAL, String::new());
            }
        }
    }

    async fn handle_open(
        self: &Arc<Self>,
        link: &Arc<Link>,
        service: &ServiceDescriptor,
        header: &MessageHeader,
        payload: Bytes,
    ) {
        let msg_id = header.msg_id;
        if link.bound().is_some() {
            self.reject(
                link,
                msg_id,
                status::BAD_MESSAGE,
                "connection already has an open object".to_string(),
            );
            return;
        }

        let request: OpenRequest = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => {
                self.reject(
                    link,
                    msg_id,
                    status::PARSE_ERROR,
                    format!("Invalid OPEN payload: {}", e),
                );
                return;
            }
        };

        if request.service != service.published_name || request.instance != service.config.instance
        {
            self.reject(
                link,
                msg_id,
                status::NO_SUCH_SERVICE,
                format!(
                    "slot {} is not {}/{}",
                    header.service_slot, request.service, request.instance
                ),
            );
            return;
        }

        if !self.authorize(service, &request) {
            warn!(
                "Denied open of {} by PID {}",
                service.published_name, request.credentials.pid
            );
            self.reject(link, msg_id, status::PERMISSION_DENIED, String::new());
            return;
        }

        if let Err(limit) = self.reserve(service) {
            self.reject(
                link,
                msg_id,
                status::BUSY,
                format!("{} is at its limit of {} objects", service.published_name, limit),
            );
            return;
        }

        let object = self
            .osbs
            .create(service.id, link.clone(), service.config.max_pending_replies);
        let ctx = OpenContext {
            object,
            credentials: request.credentials,
            flags: request.flags,
            data: Bytes::from(request.data),
        };

        match service.handler.open(&ctx).await {
            Ok(session) => {
                if !self.osbs.activate(object, session) {
                    if let Some(released) = self.osbs.abort(object) {
                        self.on_released(released);
                    }
                    self.reject(link, msg_id, status::INTERNAL, String::new());
                    return;
                }
                link.bind(service.id, object);
                debug!(
                    "Opened {} on {} for link {} ({})",
                    object, service.published_name, link.id, link.peer
                );
                self.send_reply(
                    link,
                    ReplyHeader {
                        msg_id,
                        status: status::OK,
                        object: Some(object),
                        truncated: false,
                    },
                    Bytes::new(),
                );
            }
            Err(code) => {
                if let Some(released) = self.osbs.abort(object) {
                    self.on_released(released);
                }
                self.reject(
                    link,
                    msg_id,
                    code,
                    format!("{} refused the open", service.published_name),
                );
            }
        }
    }

    async fn handle_close(
        self: &Arc<Self>,
        link: &Arc<Link>,
        service: &ServiceDescriptor,
        header: &MessageHeader,
    ) {
        let synthetic = header.flags.contains(MsgFlags::SYNTHETIC);
        let reason = if synthetic {
            CloseReason::Disconnect
        } else {
            CloseReason::ClientClose
        };

        if let Ok(object) = self.bound_object(link, service, header) {
            match self.osbs.begin_close(object) {
                Some(session) => {
                    service.handler.close(session, reason).await;
                    link.unbind(object);
                    match self.osbs.finish_close(object, service.config.release) {
                        Some(released) => self.on_released(released),
                        None => debug!("{} closing; waiting for outstanding replies", object),
                    }
                }
                None => debug!("{} is already closing", object),
            }
        }

        if !synthetic {
            self.send_reply(
                link,
                ReplyHeader {
                    msg_id: header.msg_id,
                    status: status::OK,
                    object: None,
                    truncated: false,
                },
                Bytes::new(),
            );
        }
    }

    async fn handle_notify(
        self: &Arc<Self>,
        link: &Arc<Link>,
        service: &ServiceDescriptor,
        header: &MessageHeader,
        payload: Bytes,
    ) {
        let object = match self.bound_object(link, service, header) {
            Ok(object) => object,
            Err(code) => {
                self.reject(link, header.msg_id, code, "no open object".to_string());
                return;
            }
        };
        let request: NotifyRequest = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => {
                self.reject(
                    link,
                    header.msg_id,
                    status::PARSE_ERROR,
                    format!("Invalid NOTIFY payload: {}", e),
                );
                return;
            }
        };
        let session = match self.osbs.admit(object, header) {
            Ok(session) => session,
            Err(code) => {
                self.reject(link, header.msg_id, code, String::new());
                return;
            }
        };

        let notifier = Notifier::new(object, Arc::downgrade(self));
        let outcome = service
            .handler
            .notify(session, request, notifier)
            .await;
        let (code, body) = match outcome.map(|o| serde_json::to_vec(&o)) {
            Ok(Ok(body)) => (status::OK, Bytes::from(body)),
            Ok(Err(e)) => {
                error!("Failed to encode notify outcome: {}", e);
                (status::INTERNAL, Bytes::new())
            }
            Err(code) => (code, Bytes::new()),
        };
        self.deliver_reply(object, header.msg_id, code, body, usize::MAX);

        if let Some(released) = self.osbs.complete(object) {
            self.on_released(released);
        }
    }

    async fn handle_io(
        self: &Arc<Self>,
        link: &Arc<Link>,
        service: &ServiceDescriptor,
        header: &MessageHeader,
        payload: Bytes,
    ) {
        let object = match self.bound_object(link, service, header) {
            Ok(object) => object,
            Err(code) => {
                self.reject(link, header.msg_id, code, "no open object".to_string());
                return;
            }
        };

        let len = payload.len();
        let carries_data = matches!(header.kind, MsgType::Put | MsgType::PutGet);
        if carries_data && len < service.config.min_len {
            self.reject(
                link,
                header.msg_id,
                status::BAD_MESSAGE,
                format!(
                    "{} of {} bytes is shorter than the minimum {}",
                    header.kind, len, service.config.min_len
                ),
            );
            return;
        }
        if len > service.config.max_len {
            self.reject(
                link,
                header.msg_id,
                status::BAD_MESSAGE,
                format!(
                    "{} of {} bytes exceeds the maximum {}",
                    header.kind, len, service.config.max_len
                ),
            );
            return;
        }

        let session = match self.osbs.admit(object, header) {
            Ok(session) => session,
            Err(code) => {
                self.reject(link, header.msg_id, code, String::new());
                return;
            }
        };

        let request = Request::new(header.clone(), payload, object, Arc::downgrade(self));
        service.handler.worker(session, request).await;

        if let Some(released) = self.osbs.complete(object) {
            self.on_released(released);
        }
    }
}

/// How a reader reports that its peer went away.
#[derive(Clone)]
pub(crate) enum Departures {
    /// Hand the link to the disconnect-watcher task.
    Watcher(mpsc::UnboundedSender<Arc<Link>>),
    /// Enqueue the synthetic CLOSE from the reader itself.
    Inline(mpsc::Sender<Inbound>),
}

impl Departures {
    async fn depart(&self, link: Arc<Link>) {
        match self {
            Departures::Watcher(tx) => {
                if let Err(mpsc::error::SendError(link)) = tx.send(link) {
                    link.cancel.cancel();
                }
            }
            Departures::Inline(queue) => {
                link.cancel.cancel();
                if let Some(close) = synthetic_close(&link) {
                    let _ = queue.send(close).await;
                }
            }
        }
    }
}

/// Turn peer departures into synthetic CLOSE messages.
pub(crate) async fn disconnect_watcher(
    mut departures: mpsc::UnboundedReceiver<Arc<Link>>,
    queue: mpsc::Sender<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let link = tokio::select! {
            link = departures.recv() => link,
            _ = shutdown.cancelled() => None,
        };
        let Some(link) = link else {
            break;
        };
        debug!("Link {} ({}) disconnected", link.id, link.peer);
        link.cancel.cancel();
        if let Some(close) = synthetic_close(&link) {
            if queue.send(close).await.is_err() {
                break;
            }
        }
    }
}

pub(crate) async fn dispatch_worker(
    index: usize,
    core: Arc<ServerCore>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Inbound>>>,
    shutdown: CancellationToken,
) {
    loop {
        let inbound = {
            let mut rx = tokio::select! {
                rx = queue.lock() => rx,
                _ = shutdown.cancelled() => break,
            };
            tokio::select! {
                inbound = rx.recv() => inbound,
                _ = shutdown.cancelled() => None,
            }
        };
        let Some(mut inbound) = inbound else {
            break;
        };
        let done = inbound.done.take();
        core.dispatch(inbound).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }
    debug!("Dispatch worker {} stopped", index);
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    core: Arc<ServerCore>,
    queue: mpsc::Sender<Inbound>,
    departures: Departures,
    shutdown: CancellationToken,
) {
    let mut next_link: u64 = 1;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let current = core.connections.load(Ordering::Relaxed);
                        if current >= IpcConfig::MAX_CONNECTIONS {
                            warn!(
                                "Rejecting connection from {}: at max capacity ({})",
                                peer_addr,
                                IpcConfig::MAX_CONNECTIONS
                            );
                            continue;
                        }

                        core.connections.fetch_add(1, Ordering::Relaxed);
                        let (link, outbound) = Link::new(next_link, peer_addr);
                        next_link += 1;
                        let core = core.clone();
                        let queue = queue.clone();
                        let departures = departures.clone();
                        let shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            debug!("Link {} connected from {}", link.id, peer_addr);
                            if let Err(e) =
                                serve_connection(stream, link, outbound, queue, departures, shutdown).await
                            {
                                debug!("Connection {} ended: {}", peer_addr, e);
                            }
                            core.connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    link: Arc<Link>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    queue: mpsc::Sender<Inbound>,
    departures: Departures,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let (mut reader, writer) = stream.into_split();
    tokio::spawn(write_loop(writer, outbound, link.cancel.clone()));

    let result = loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader) => result,
            _ = link.cancel.cancelled() => break Ok(()),
            _ = shutdown.cancelled() => break Ok(()),
        };
        match frame {
            Ok(Some(Frame {
                header: FrameHeader::Request(header),
                payload,
            })) => {
                let (done_tx, done_rx) = oneshot::channel();
                let inbound = Inbound {
                    link: link.clone(),
                    header,
                    payload,
                    done: Some(done_tx),
                };
                if queue.send(inbound).await.is_err() {
                    break Ok(());
                }
                // Resolves with an error if the worker was lost; keep reading either way.
                let _ = done_rx.await;
            }
            Ok(Some(other)) => {
                warn!("Link {} sent a non-request frame: {:?}", link.id, other.header);
            }
            Ok(None) => break Ok(()),
            Err(SvcError::Json { message, .. }) => {
                warn!("Link {} sent an unparseable header: {}", link.id, message);
                link.send(Frame::new(
                    FrameHeader::Reply(ReplyHeader {
                        msg_id: 0,
                        status: status::PARSE_ERROR,
                        object: None,
                        truncated: false,
                    }),
                    Bytes::from(message),
                ));
            }
            Err(e) => break Err(e),
        }
    };

    // On shutdown every OSB is released wholesale; no CLOSE is dispatched.
    if shutdown.is_cancelled() {
        link.cancel.cancel();
    } else {
        departures.depart(link).await;
    }
    result
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => frame,
            _ = cancel.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        match write_frame(&mut writer, &frame).await {
            Ok(()) => {}
            // Encoding failed before any byte was written; the stream is intact.
            Err(e @ (SvcError::Protocol { .. } | SvcError::Json { .. })) => {
                warn!("Dropping unencodable frame {:?}: {}", frame.header, e);
            }
            Err(e) => {
                debug!("Write failed: {}", e);
                cancel.cancel();
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::descriptor::{ServiceConfig, ServiceHandler, TypedService};

    #[test]
    fn test_truncate_marks_cut_payloads() {
        let (body, cut) = truncate(Bytes::from_static(b"abcdef"), 4);
        assert_eq!(body.as_ref(), b"abcd");
        assert!(cut);

        let (body, cut) = truncate(Bytes::from_static(b"ab"), 4);
        assert_eq!(body.as_ref(), b"ab");
        assert!(!cut);
    }

    #[test]
    fn test_synthetic_close_needs_binding() {
        let link = Link::detached();
        assert!(synthetic_close(&link).is_none());

        let object = ObjectRef {
            slot: 2,
            generation: 5,
        };
        link.bind(ServiceId(1), object);
        let close = synthetic_close(&link).unwrap();
        assert_eq!(close.header.kind, MsgType::Close);
        assert_eq!(close.header.service_slot, 1);
        assert_eq!(close.header.object, Some(object));
        assert!(close.header.flags.contains(MsgFlags::SYNTHETIC));
        assert!(close.done.is_none());

        link.unbind(object);
        assert!(link.bound().is_none());
    }

    #[test]
    fn test_stats_start_empty() {
        let core = ServerCore::new(Vec::new(), None);
        let stats = core.stats();
        assert_eq!(stats, ServerStats::default());
    }

    struct Idle;

    #[async_trait::async_trait]
    impl ServiceHandler for Idle {
        type Session = ();

        async fn open(&self, _ctx: &OpenContext) -> Result<(), i32> {
            Ok(())
        }

        async fn worker(&self, _session: Arc<()>, _request: Request) {}
    }

    fn noop(object: ObjectRef, msg_id: MsgId, link: &Arc<Link>) -> Inbound {
        let mut header = MessageHeader::new(MsgType::Noop, 0, msg_id);
        header.object = Some(object);
        Inbound {
            link: link.clone(),
            header,
            payload: Bytes::new(),
            done: None,
        }
    }

    #[tokio::test]
    async fn test_noop_on_closing_object_is_rejected() {
        let descriptor = ServiceDescriptor::new(
            ServiceId(0),
            ServiceConfig::new("idle"),
            "idle".to_string(),
            Arc::new(TypedService::new(Idle)),
        );
        let core = Arc::new(ServerCore::new(vec![descriptor], None));
        let (link, mut outbound) = Link::new(1, SocketAddr::from(([127, 0, 0, 1], 0)));
        let object = core.osbs.create(ServiceId(0), link.clone(), 4);
        assert!(core.osbs.activate(object, Arc::new(())));
        link.bind(ServiceId(0), object);

        core.dispatch(noop(object, 1, &link)).await;
        assert!(outbound.try_recv().is_err());

        assert!(core.osbs.begin_close(object).is_some());
        core.dispatch(noop(object, 2, &link)).await;
        let frame = outbound.try_recv().unwrap();
        match frame.header {
            FrameHeader::Reply(reply) => {
                assert_eq!(reply.msg_id, 2);
                assert_eq!(reply.status, status::NO_SUCH_OBJECT);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
