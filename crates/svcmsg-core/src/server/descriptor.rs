//! Service descriptors and the callback trait services implement.
//!
//! A service is registered once, before the dispatch loop starts, and its
//! descriptor is read-only from then on. Only the active-OSB reference count
//! changes, and only under the server's counters lock.

use super::reply::{Notifier, Request};
use crate::config::{IpcConfig, OpenFlags, ServiceFlags};
use crate::error::status;
use crate::message::{NotifyOutcome, NotifyRequest, ObjectRef, PeerCredentials};
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::error;

/// Index of a registered service; doubles as the wire `service_slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u32);

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "svc#{}", self.0)
    }
}

/// When an OSB's state is released after its close callback runs.
///
/// The two variants are two ownership models: `Deferred` suits services
/// that answer every request exactly once, `Immediate` suits services that
/// send zero-to-many replies from outside the callback and therefore accept
/// that late replies are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// Keep the OSB until no callback is running and no message id awaits a reply.
    #[default]
    Deferred,
    /// Release as soon as the close callback returns; later replies are dropped.
    Immediate,
}

/// Registration parameters for one service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub instance: String,
    /// Free-form, for discovery and diagnostics only.
    pub capabilities: String,
    /// Smallest PUT/PUTGET payload the worker accepts.
    pub min_len: usize,
    pub max_len: usize,
    /// Concurrent OSBs (connections) the service accepts.
    pub max_osbs: usize,
    /// Message ids one OSB may have awaiting a reply at once.
    pub max_pending_replies: usize,
    pub release: ReleasePolicy,
    pub flags: ServiceFlags,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: IpcConfig::DEFAULT_INSTANCE.to_string(),
            capabilities: String::new(),
            min_len: 0,
            max_len: IpcConfig::MAX_MESSAGE_SIZE,
            max_osbs: IpcConfig::DEFAULT_MAX_OSBS,
            max_pending_replies: IpcConfig::DEFAULT_MAX_PENDING_REPLIES,
            release: ReleasePolicy::Deferred,
            flags: ServiceFlags::empty(),
        }
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn capabilities(mut self, capabilities: impl Into<String>) -> Self {
        self.capabilities = capabilities.into();
        self
    }

    pub fn min_len(mut self, min_len: usize) -> Self {
        self.min_len = min_len;
        self
    }

    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn max_osbs(mut self, max_osbs: usize) -> Self {
        self.max_osbs = max_osbs;
        self
    }

    pub fn max_pending_replies(mut self, max: usize) -> Self {
        self.max_pending_replies = max;
        self
    }

    pub fn release(mut self, policy: ReleasePolicy) -> Self {
        self.release = policy;
        self
    }

    pub fn flags(mut self, flags: ServiceFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// What the `open` callback sees.
#[derive(Debug, Clone)]
pub struct OpenContext {
    pub object: ObjectRef,
    pub credentials: PeerCredentials,
    pub flags: OpenFlags,
    pub data: Bytes,
}

/// Why a close callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client called `close`.
    ClientClose,
    /// The peer went away without closing.
    Disconnect,
}

/// Callbacks of a registered service.
///
/// The substrate never holds an OSB lock while one of these runs, so a
/// callback may freely issue further requests of its own.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// Per-connection user data, created by `open`.
    type Session: Send + Sync + 'static;

    /// Local access check; consulted unless the service defers to the
    /// server's `PermissionManager`.
    fn authorize(&self, _peer: &PeerCredentials, _flags: OpenFlags) -> bool {
        true
    }

    /// Create the session for a new OSB, or refuse with a status code.
    async fn open(&self, ctx: &OpenContext) -> Result<Self::Session, i32>;

    /// Handle a PUT, GET or PUTGET.
    ///
    /// Reply through `request` now, or defer it and reply later from anywhere.
    async fn worker(&self, session: Arc<Self::Session>, request: Request);

    async fn close(&self, _session: Arc<Self::Session>, _reason: CloseReason) {}

    /// Arm a readiness pulse. The default refuses with `NOT_SUPPORTED`.
    async fn notify(
        &self,
        _session: Arc<Self::Session>,
        _request: NotifyRequest,
        _notifier: Notifier,
    ) -> Result<NotifyOutcome, i32> {
        Err(status::NOT_SUPPORTED)
    }
}

pub(crate) type SessionBox = Arc<dyn Any + Send + Sync>;

/// Object-safe view of a `ServiceHandler`.
#[async_trait]
pub(crate) trait ErasedService: Send + Sync {
    fn authorize(&self, peer: &PeerCredentials, flags: OpenFlags) -> bool;
    async fn open(&self, ctx: &OpenContext) -> Result<SessionBox, i32>;
    async fn worker(&self, session: SessionBox, request: Request);
    async fn close(&self, session: SessionBox, reason: CloseReason);
    async fn notify(
        &self,
        session: SessionBox,
        request: NotifyRequest,
        notifier: Notifier,
    ) -> Result<NotifyOutcome, i32>;
}

/// Wrapper that recovers the concrete session type before each callback.
pub(crate) struct TypedService<S: ServiceHandler> {
    handler: S,
}

impl<S: ServiceHandler> TypedService<S> {
    pub(crate) fn new(handler: S) -> Self {
        Self { handler }
    }

    fn session(session: SessionBox) -> Option<Arc<S::Session>> {
        match session.downcast::<S::Session>() {
            Ok(s) => Some(s),
            Err(_) => {
                error!(
                    "Session type mismatch for {}",
                    std::any::type_name::<S>()
                );
                None
            }
        }
    }
}

#[async_trait]
impl<S: ServiceHandler> ErasedService for TypedService<S> {
    fn authorize(&self, peer: &PeerCredentials, flags: OpenFlags) -> bool {
        self.handler.authorize(peer, flags)
    }

    async fn open(&self, ctx: &OpenContext) -> Result<SessionBox, i32> {
        let session = self.handler.open(ctx).await?;
        Ok(Arc::new(session))
    }

    async fn worker(&self, session: SessionBox, request: Request) {
        match Self::session(session) {
            Some(s) => self.handler.worker(s, request).await,
            None => {
                request.fail(status::INTERNAL);
            }
        }
    }

    async fn close(&self, session: SessionBox, reason: CloseReason) {
        if let Some(s) = Self::session(session) {
            self.handler.close(s, reason).await;
        }
    }

    async fn notify(
        &self,
        session: SessionBox,
        request: NotifyRequest,
        notifier: Notifier,
    ) -> Result<NotifyOutcome, i32> {
        match Self::session(session) {
            Some(s) => self.handler.notify(s, request, notifier).await,
            None => Err(status::INTERNAL),
        }
    }
}

/// A registered service.
pub struct ServiceDescriptor {
    pub(crate) id: ServiceId,
    pub(crate) config: ServiceConfig,
    /// Name as published in the namespace (domain-qualified when relative).
    pub(crate) published_name: String,
    pub(crate) handler: Arc<dyn ErasedService>,
    /// Active OSBs; only changed under the server counters lock.
    pub(crate) active_osbs: AtomicUsize,
}

impl ServiceDescriptor {
    pub(crate) fn new(
        id: ServiceId,
        config: ServiceConfig,
        published_name: String,
        handler: Arc<dyn ErasedService>,
    ) -> Self {
        Self {
            id,
            config,
            published_name,
            handler,
            active_osbs: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn published_name(&self) -> &str {
        &self.published_name
    }

    pub fn active_osbs(&self) -> usize {
        self.active_osbs.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("id", &self.id)
            .field("name", &self.published_name)
            .field("instance", &self.config.instance)
            .field("release", &self.config.release)
            .field("active_osbs", &self.active_osbs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_config_defaults() {
        let config = ServiceConfig::new("echo");
        assert_eq!(config.instance, IpcConfig::DEFAULT_INSTANCE);
        assert_eq!(config.release, ReleasePolicy::Deferred);
        assert_eq!(config.min_len, 0);
        assert!(config.flags.is_empty());
    }

    #[test]
    fn test_service_config_builder() {
        let config = ServiceConfig::new("queue")
            .instance("jobs")
            .capabilities("fifo")
            .min_len(1)
            .max_pending_replies(3)
            .release(ReleasePolicy::Immediate)
            .flags(ServiceFlags::RELATIVE_PATH);
        assert_eq!(config.instance, "jobs");
        assert_eq!(config.min_len, 1);
        assert_eq!(config.max_pending_replies, 3);
        assert_eq!(config.release, ReleasePolicy::Immediate);
        assert!(config.flags.contains(ServiceFlags::RELATIVE_PATH));
    }

    struct Counter;

    #[async_trait]
    impl ServiceHandler for Counter {
        type Session = u32;

        async fn open(&self, _ctx: &OpenContext) -> Result<u32, i32> {
            Ok(7)
        }

        async fn worker(&self, _session: Arc<u32>, _request: Request) {}
    }

    #[tokio::test]
    async fn test_typed_service_round_trips_session() {
        let erased: Arc<dyn ErasedService> = Arc::new(TypedService::new(Counter));
        let ctx = OpenContext {
            object: ObjectRef {
                slot: 0,
                generation: 0,
            },
            credentials: PeerCredentials::current(),
            flags: OpenFlags::empty(),
            data: Bytes::new(),
        };
        let session = erased.open(&ctx).await.unwrap();
        assert_eq!(session.downcast::<u32>().ok().map(|s| *s), Some(7));
    }
}
