//! Client connection to a named service.
//!
//! A `Connection` owns one TCP connection and therefore one OSB on the
//! server. Requests are written by a writer task and replies are routed back
//! to their callers by message id from a reader task, so a single
//! `Connection` can be shared (behind an `Arc`) by many concurrent callers.

use super::msg_id::MsgIdGenerator;
use crate::cancel::CancellationToken;
use crate::config::{IpcConfig, NamespacePath, OpenFlags, TimeoutPolicy};
use crate::error::status;
use crate::message::{
    FrameHeader, MessageHeader, MsgFlags, MsgId, MsgType, NotifyKind, NotifyOutcome,
    NotifyRequest, ObjectRef, OpenRequest, PeerCredentials, Pulse, ReplyHeader,
};
use crate::namespace::Namespace;
use crate::protocol::{read_frame, write_frame, Frame};
use crate::{Result, SvcError};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Options for [`Connection::open`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub namespace: NamespacePath,
    pub flags: OpenFlags,
    pub credentials: PeerCredentials,
    /// Applied to PUT acknowledgments, GET and PUTGET.
    pub timeout: TimeoutPolicy,
    /// Bytes handed to the service's open callback.
    pub open_data: Vec<u8>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            namespace: NamespacePath::Default,
            flags: OpenFlags::READ | OpenFlags::WRITE,
            credentials: PeerCredentials::current(),
            timeout: TimeoutPolicy::default(),
            open_data: Vec::new(),
        }
    }
}

impl ConnectOptions {
    pub fn namespace(mut self, namespace: NamespacePath) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn credentials(mut self, credentials: PeerCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn open_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.open_data = data.into();
        self
    }
}

/// Successful reply to a GET or PUTGET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub payload: Bytes,
    /// The server cut the payload to the requested capacity.
    pub truncated: bool,
}

struct Reply {
    header: ReplyHeader,
    payload: Bytes,
}

/// State shared between callers and the reader task.
#[derive(Default)]
struct ClientShared {
    pending: Mutex<HashMap<MsgId, oneshot::Sender<Reply>>>,
    /// Ids whose caller stopped waiting; their replies are dropped on arrival.
    abandoned: Mutex<HashSet<MsgId>>,
    closing: AtomicBool,
    /// Fired when the reader stops (server gone or connection shut).
    gone: CancellationToken,
}

impl ClientShared {
    fn in_use(&self, id: MsgId) -> bool {
        lock(&self.pending).contains_key(&id) || lock(&self.abandoned).contains(&id)
    }

    /// Stop waiting for `id`. Returns false when its reply already arrived.
    fn abandon(&self, id: MsgId) -> bool {
        let mut pending = lock(&self.pending);
        if pending.remove(&id).is_some() {
            lock(&self.abandoned).insert(id);
            true
        } else {
            false
        }
    }

    fn route_reply(&self, header: ReplyHeader, payload: Bytes) {
        let mut pending = lock(&self.pending);
        if let Some(tx) = pending.remove(&header.msg_id) {
            // Sent under the lock so a timing-out caller sees either the
            // waiter or the delivered reply, never neither.
            let _ = tx.send(Reply { header, payload });
            return;
        }
        let was_abandoned = lock(&self.abandoned).remove(&header.msg_id);
        drop(pending);

        if was_abandoned {
            debug!("Discarding late reply to #{}", header.msg_id);
        } else if header.status != status::OK {
            warn!(
                "Server rejected #{} with status {}: {}",
                header.msg_id,
                header.status,
                String::from_utf8_lossy(&payload)
            );
        } else {
            debug!("Ignoring unsolicited reply #{}", header.msg_id);
        }
    }

    /// Wake every waiter; they observe `Interrupted` or `PeerGone`.
    fn fail_waiters(&self) {
        lock(&self.pending).clear();
    }

    fn gone_error(&self) -> SvcError {
        if self.closing.load(Ordering::SeqCst) {
            SvcError::Interrupted
        } else {
            SvcError::PeerGone {
                message: "server connection lost".to_string(),
            }
        }
    }
}

/// Marks a message id abandoned if the waiting future is dropped early.
struct Waiting<'a> {
    shared: &'a ClientShared,
    msg_id: MsgId,
    armed: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon(self.msg_id);
        }
    }
}

/// Request channel: id allocation, outbound frames, reply correlation.
struct Channel {
    ids: MsgIdGenerator,
    outbound: mpsc::UnboundedSender<Frame>,
    shared: Arc<ClientShared>,
}

impl Channel {
    fn next_id(&self) -> MsgId {
        self.ids.next_id(|id| self.shared.in_use(id))
    }

    fn send(&self, header: MessageHeader, payload: Bytes) -> Result<()> {
        self.outbound
            .send(Frame::new(FrameHeader::Request(header), payload))
            .map_err(|_| self.shared.gone_error())
    }

    async fn transact(
        &self,
        header: MessageHeader,
        payload: Bytes,
        policy: TimeoutPolicy,
    ) -> Result<Reply> {
        let msg_id = header.msg_id;
        let (tx, mut rx) = oneshot::channel();
        lock(&self.shared.pending).insert(msg_id, tx);
        if let Err(e) = self.send(header, payload) {
            lock(&self.shared.pending).remove(&msg_id);
            return Err(e);
        }

        let mut waiting = Waiting {
            shared: &self.shared,
            msg_id,
            armed: true,
        };
        let started = tokio::time::Instant::now();
        let wall_start = SystemTime::now();

        // The timer runs on the monotonic clock; re-check after each wake so
        // a realtime deadline that has not passed yet keeps waiting.
        let received = loop {
            let Some(budget) = policy.remaining(started, wall_start) else {
                break (&mut rx).await.map_err(|_| ());
            };
            if !budget.is_zero() {
                match tokio::time::timeout(budget, &mut rx).await {
                    Ok(result) => break result.map_err(|_| ()),
                    Err(_) => continue,
                }
            }
            waiting.armed = false;
            if self.shared.abandon(msg_id) {
                let after = policy.timeout.unwrap_or_default();
                debug!("#{} timed out after {:?}", msg_id, after);
                return Err(SvcError::Timeout(after));
            }
            // The reply landed between the timer firing and the abandon.
            break rx.try_recv().map_err(|_| ());
        };
        waiting.armed = false;

        received.map_err(|_| self.shared.gone_error())
    }
}

/// Background tasks of a connection; stopped when dropped.
struct Tasks {
    stop: CancellationToken,
    reader: JoinHandle<()>,
}

impl Drop for Tasks {
    fn drop(&mut self) {
        self.stop.cancel();
        self.reader.abort();
    }
}

/// Open connection to one service instance.
pub struct Connection {
    service: String,
    instance: String,
    addr: SocketAddr,
    service_slot: u32,
    object: ObjectRef,
    channel: Channel,
    pulses: tokio::sync::Mutex<mpsc::UnboundedReceiver<Pulse>>,
    timeout: Mutex<TimeoutPolicy>,
    tasks: Tasks,
}

impl Connection {
    /// Resolve `name` in the namespace and open it.
    ///
    /// `instance` defaults to [`IpcConfig::DEFAULT_INSTANCE`].
    pub async fn open(name: &str, instance: Option<&str>, options: ConnectOptions) -> Result<Self> {
        let instance = instance.unwrap_or(IpcConfig::DEFAULT_INSTANCE);
        let namespace = Namespace::open_path(&options.namespace)?.ok_or_else(|| SvcError::Config {
            message: "Namespace lookups are disabled; use Connection::open_at".to_string(),
        })?;
        let entry = namespace
            .resolve(name, instance)?
            .ok_or_else(|| SvcError::ServiceNotFound {
                name: name.to_string(),
                instance: instance.to_string(),
            })?;
        Self::open_at(entry.addr, entry.service_slot, name, instance, options).await
    }

    /// Open a service at a known address and slot, bypassing the namespace.
    pub async fn open_at(
        addr: SocketAddr,
        service_slot: u32,
        name: &str,
        instance: &str,
        options: ConnectOptions,
    ) -> Result<Self> {
        let not_found = || SvcError::ServiceNotFound {
            name: name.to_string(),
            instance: instance.to_string(),
        };
        let stream = match tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Connect to {} for {} failed: {}", addr, name, e);
                return Err(not_found());
            }
            Err(_) => {
                debug!("Connect to {} for {} timed out", addr, name);
                return Err(not_found());
            }
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let shared = Arc::new(ClientShared::default());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (pulse_tx, pulse_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        tokio::spawn(write_loop(writer, out_rx, stop.clone()));
        let tasks = Tasks {
            stop,
            reader: tokio::spawn(read_loop(reader, shared.clone(), pulse_tx)),
        };
        let channel = Channel {
            ids: MsgIdGenerator::new(),
            outbound: out_tx,
            shared,
        };

        let request = OpenRequest {
            service: name.to_string(),
            instance: instance.to_string(),
            flags: options.flags,
            credentials: options.credentials,
            data: options.open_data,
        };
        let payload = Bytes::from(serde_json::to_vec(&request)?);
        let mut header = MessageHeader::new(MsgType::Open, service_slot, channel.next_id());
        header.send_len = payload.len() as u32;

        let reply = channel
            .transact(header, payload, TimeoutPolicy::new(IpcConfig::CONNECT_TIMEOUT))
            .await?;
        match reply.header.status {
            status::OK => {}
            status::NO_SUCH_SERVICE => return Err(not_found()),
            code => return Err(SvcError::from_status(code, reply.payload, name)),
        }
        let object = reply.header.object.ok_or_else(|| SvcError::Protocol {
            code: status::INTERNAL,
            message: "OPEN reply carried no object".to_string(),
        })?;

        debug!("Opened {}/{} at {} as {}", name, instance, addr, object);

        Ok(Self {
            service: name.to_string(),
            instance: instance.to_string(),
            addr,
            service_slot,
            object,
            channel,
            pulses: tokio::sync::Mutex::new(pulse_rx),
            timeout: Mutex::new(options.timeout),
            tasks,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Server-side OSB this connection is bound to.
    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn is_closed(&self) -> bool {
        self.channel.shared.closing.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> TimeoutPolicy {
        *lock(&self.timeout)
    }

    pub fn set_timeout(&self, policy: TimeoutPolicy) {
        *lock(&self.timeout) = policy;
    }

    fn ensure_open(&self) -> Result<()> {
        let shared = &self.channel.shared;
        if shared.closing.load(Ordering::SeqCst) {
            return Err(SvcError::ConnectionClosed);
        }
        if shared.gone.is_cancelled() {
            return Err(shared.gone_error());
        }
        Ok(())
    }

    fn header(&self, kind: MsgType, payload_len: usize) -> Result<MessageHeader> {
        let limit = IpcConfig::MAX_PAYLOAD_SIZE;
        if payload_len > limit {
            return Err(SvcError::Protocol {
                code: status::BAD_MESSAGE,
                message: format!("payload of {} bytes exceeds {}", payload_len, limit),
            });
        }
        let mut header = MessageHeader::new(kind, self.service_slot, self.channel.next_id());
        header.object = Some(self.object);
        header.send_len = payload_len as u32;
        Ok(header)
    }

    async fn call(&self, header: MessageHeader, payload: Bytes) -> Result<Reply> {
        let reply = self
            .channel
            .transact(header, payload, self.timeout())
            .await?;
        if reply.header.status != status::OK {
            return Err(SvcError::from_status(
                reply.header.status,
                reply.payload,
                &self.service,
            ));
        }
        Ok(reply)
    }

    /// One-way send. Returns the id the message went out with.
    pub fn put(&self, data: impl Into<Bytes>) -> Result<MsgId> {
        self.ensure_open()?;
        let data = data.into();
        let header = self.header(MsgType::Put, data.len())?;
        let msg_id = header.msg_id;
        self.channel.send(header, data)?;
        Ok(msg_id)
    }

    /// Send and wait for the service to acknowledge.
    pub async fn put_acked(&self, data: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let data = data.into();
        let mut header = self.header(MsgType::Put, data.len())?;
        header.flags = MsgFlags::ACK;
        self.call(header, data).await.map(|_| ())
    }

    /// Fetch data identified by `handle_ref`, accepting at most `capacity` bytes.
    pub async fn get(&self, handle_ref: u64, capacity: usize) -> Result<Response> {
        self.ensure_open()?;
        let mut header = self.header(MsgType::Get, 0)?;
        header.handle_ref = handle_ref;
        header.reply_cap = u32::try_from(capacity).unwrap_or(u32::MAX);
        let reply = self.call(header, Bytes::new()).await?;
        Ok(Response {
            payload: reply.payload,
            truncated: reply.header.truncated,
        })
    }

    /// Send `data` and wait for a reply of at most `capacity` bytes.
    pub async fn putget(&self, data: impl Into<Bytes>, capacity: usize) -> Result<Response> {
        self.ensure_open()?;
        let data = data.into();
        let mut header = self.header(MsgType::PutGet, data.len())?;
        header.reply_cap = u32::try_from(capacity).unwrap_or(u32::MAX);
        let reply = self.call(header, data).await?;
        Ok(Response {
            payload: reply.payload,
            truncated: reply.header.truncated,
        })
    }

    /// Keep-alive that never reaches the service.
    pub fn noop(&self) -> Result<()> {
        self.ensure_open()?;
        let header = self.header(MsgType::Noop, 0)?;
        self.channel.send(header, Bytes::new())
    }

    /// Ask to be pulsed with `code` when `kind` becomes ready.
    pub async fn arm_notify(&self, kind: NotifyKind, code: i32) -> Result<NotifyOutcome> {
        self.ensure_open()?;
        let payload = Bytes::from(serde_json::to_vec(&NotifyRequest { kind, code })?);
        let header = self.header(MsgType::Notify, payload.len())?;
        let reply = self.call(header, payload).await?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }

    /// Wait for the next pulse.
    pub async fn next_pulse(&self) -> Result<Pulse> {
        let mut pulses = self.pulses.lock().await;
        match pulses.recv().await {
            Some(pulse) => Ok(pulse),
            None if self.is_closed() => Err(SvcError::ConnectionClosed),
            None => Err(self.channel.shared.gone_error()),
        }
    }

    /// A pulse that already arrived, if any.
    pub fn try_next_pulse(&self) -> Option<Pulse> {
        self.pulses.try_lock().ok()?.try_recv().ok()
    }

    /// Close the OSB and the connection.
    ///
    /// Waits up to [`IpcConfig::CLOSE_ACK_TIMEOUT`] for the server to run
    /// the close callback. Callers still waiting on a reply get
    /// `Interrupted`; later operations fail with `ConnectionClosed`.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.channel.shared;
        if shared.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut result = Ok(());
        if !shared.gone.is_cancelled() {
            let mut header = MessageHeader::new(MsgType::Close, self.service_slot, self.channel.next_id());
            header.object = Some(self.object);
            match self
                .channel
                .transact(header, Bytes::new(), TimeoutPolicy::new(IpcConfig::CLOSE_ACK_TIMEOUT))
                .await
            {
                Ok(_) | Err(SvcError::Interrupted) | Err(SvcError::PeerGone { .. }) => {}
                Err(SvcError::Timeout(after)) => {
                    warn!("{} did not acknowledge close within {:?}", self.service, after);
                }
                Err(e) => result = Err(e),
            }
        }

        shared.fail_waiters();
        self.tasks.stop.cancel();
        debug!("Closed {} on {}", self.object, self.service);
        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("service", &self.service)
            .field("instance", &self.instance)
            .field("addr", &self.addr)
            .field("object", &self.object)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<ClientShared>,
    pulses: mpsc::UnboundedSender<Pulse>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame {
                header: FrameHeader::Reply(header),
                payload,
            })) => shared.route_reply(header, payload),
            Ok(Some(Frame {
                header: FrameHeader::Pulse(pulse),
                payload,
            })) => {
                let _ = pulses.send(Pulse {
                    code: pulse.code,
                    value: pulse.value,
                    msg_id: pulse.msg_id,
                    payload,
                });
            }
            Ok(Some(Frame {
                header: FrameHeader::Request(header),
                ..
            })) => {
                warn!("Server sent a request frame ({} #{})", header.kind, header.msg_id);
            }
            Ok(None) => {
                debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                debug!("Connection read failed: {}", e);
                break;
            }
        }
    }
    shared.gone.cancel();
    shared.fail_waiters();
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => frame,
            _ = stop.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("Connection write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
