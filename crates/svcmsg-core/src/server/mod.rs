//! Server side of the substrate.
//!
//! Build a [`Server`], register services on it, then [`Server::start`] it to
//! get a [`ServerHandle`]. Starting binds a loopback listener, publishes every
//! service in the namespace and spawns the dispatch workers. Dropping the
//! handle shuts the server down and withdraws its services.

pub mod descriptor;
pub(crate) mod dispatch;
pub mod osb;
pub mod permissions;
pub mod reply;

pub use descriptor::{
    CloseReason, OpenContext, ReleasePolicy, ServiceConfig, ServiceDescriptor, ServiceHandler,
    ServiceId,
};
pub use dispatch::ServerStats;
pub use osb::{LifecycleState, OsbSnapshot};
pub use permissions::{PermissionManager, SameUser, UidAllowList};
pub use reply::{Notifier, ReplyContext, ReplyOutcome, ReplyToken, Request};

use crate::cancel::CancellationToken;
use crate::config::{IpcConfig, ServerConfig, ServerFlags, ServiceFlags};
use crate::message::ObjectRef;
use crate::namespace::Namespace;
use crate::{Result, SvcError};
use descriptor::TypedService;
use dispatch::{accept_loop, dispatch_worker, disconnect_watcher, Departures, ServerCore};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A server being configured. Services can only be added before `start`.
pub struct Server {
    config: ServerConfig,
    services: Vec<ServiceDescriptor>,
    permissions: Option<Arc<dyn PermissionManager>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            services: Vec::new(),
            permissions: None,
        }
    }

    /// Access policy for services flagged `EXTERNAL_PERMISSIONS`.
    pub fn with_permissions(mut self, manager: impl PermissionManager) -> Self {
        self.permissions = Some(Arc::new(manager));
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Register a service.
    ///
    /// Fails with `DuplicateService` when this server already registered
    /// the same (name, instance) and with `CapacityExceeded` when the
    /// server's service table is full. A live service of the same name in
    /// another process is detected when the server starts.
    pub fn register<S: ServiceHandler>(
        &mut self,
        config: ServiceConfig,
        handler: S,
    ) -> Result<ServiceId> {
        if config.name.is_empty() || config.name.contains('/') {
            return Err(SvcError::Config {
                message: format!("Invalid service name {:?}", config.name),
            });
        }
        if config.min_len > config.max_len {
            return Err(SvcError::Config {
                message: format!(
                    "{}: min_len {} exceeds max_len {}",
                    config.name, config.min_len, config.max_len
                ),
            });
        }
        if config.max_pending_replies == 0 || config.max_osbs == 0 {
            return Err(SvcError::Config {
                message: format!("{}: limits must be at least 1", config.name),
            });
        }
        if self.services.len() >= self.config.max_services {
            return Err(SvcError::CapacityExceeded {
                limit: self.config.max_services,
            });
        }

        let published_name = if config.flags.contains(ServiceFlags::RELATIVE_PATH) {
            match &self.config.domain {
                Some(domain) => format!("{}/{}", domain, config.name),
                None => {
                    return Err(SvcError::Config {
                        message: format!("{}: relative names need a server domain", config.name),
                    })
                }
            }
        } else {
            config.name.clone()
        };

        if self
            .services
            .iter()
            .any(|s| s.published_name == published_name && s.config.instance == config.instance)
        {
            return Err(SvcError::DuplicateService {
                name: published_name,
                instance: config.instance,
            });
        }

        let id = ServiceId(self.services.len() as u32);
        info!(
            "Registered {}/{} as {} ({:?} release)",
            published_name, config.instance, id, config.release
        );
        self.services.push(ServiceDescriptor::new(
            id,
            config,
            published_name,
            Arc::new(TypedService::new(handler)),
        ));
        Ok(id)
    }

    /// Bind, publish and start dispatching.
    pub async fn start(self) -> Result<ServerHandle> {
        let Server {
            config,
            services,
            permissions,
        } = self;

        if permissions.is_none() {
            if let Some(svc) = services
                .iter()
                .find(|s| s.config.flags.contains(ServiceFlags::EXTERNAL_PERMISSIONS))
            {
                return Err(SvcError::Config {
                    message: format!(
                        "{} uses external permissions but no permission manager is set",
                        svc.published_name
                    ),
                });
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        if config.flags.contains(ServerFlags::NO_CLOSE_ON_EXEC) {
            inherit_across_exec(&listener)?;
        }

        let namespace = Namespace::open_path(&config.namespace)?;
        if let Some(ns) = &namespace {
            publish_all(ns, &services, addr)?;
        }

        let service_count = services.len();
        let core = Arc::new(ServerCore::new(services, permissions));
        let shutdown = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::channel(IpcConfig::DISPATCH_QUEUE_DEPTH);
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let mut tasks = Vec::new();

        let departures = if config.flags.contains(ServerFlags::NO_DISCONNECT_WATCHER) {
            Departures::Inline(queue_tx.clone())
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            tasks.push(tokio::spawn(disconnect_watcher(
                rx,
                queue_tx.clone(),
                shutdown.clone(),
            )));
            Departures::Watcher(tx)
        };

        for index in 0..config.dispatch_threads.max(1) {
            core.live_dispatchers.fetch_add(1, Ordering::Relaxed);
            let worker = tokio::spawn(dispatch_worker(
                index,
                core.clone(),
                queue_rx.clone(),
                shutdown.clone(),
            ));
            let monitor_core = core.clone();
            tasks.push(tokio::spawn(async move {
                let result = worker.await;
                monitor_core.live_dispatchers.fetch_sub(1, Ordering::Relaxed);
                if let Err(e) = result {
                    if e.is_panic() {
                        error!("Dispatch worker {} lost to a panicking callback", index);
                    }
                }
            }));
        }

        tasks.push(tokio::spawn(accept_loop(
            listener,
            core.clone(),
            queue_tx,
            departures,
            shutdown.clone(),
        )));

        info!(
            "Server listening on {} with {} service(s) and {} dispatch worker(s)",
            addr,
            service_count,
            config.dispatch_threads.max(1)
        );

        Ok(ServerHandle {
            addr,
            core,
            shutdown,
            namespace,
            tasks,
            stopped: false,
        })
    }

    /// Start and serve until ctrl-c or until the handle is shut down.
    pub async fn run(self) -> Result<()> {
        let mut handle = self.start().await?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Interrupt received"),
                    Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
                }
            }
            _ = handle.shutdown.cancelled() => {}
        }
        handle.shutdown();
        handle.wait().await;
        Ok(())
    }
}

fn publish_all(ns: &Namespace, services: &[ServiceDescriptor], addr: SocketAddr) -> Result<()> {
    for svc in services {
        let entry = Namespace::entry(
            &svc.published_name,
            &svc.config.instance,
            addr,
            svc.id.0,
            &svc.config.capabilities,
            u32::try_from(svc.config.min_len).unwrap_or(u32::MAX),
        );
        if let Err(e) = ns.publish(&entry) {
            if let Err(cleanup) = ns.withdraw_server(std::process::id(), addr) {
                warn!("Failed to withdraw partial registration: {}", cleanup);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Clear close-on-exec on the listener so exec'd children keep it.
#[cfg(unix)]
fn inherit_across_exec(listener: &TcpListener) -> Result<()> {
    use std::os::fd::AsRawFd;
    set_close_on_exec(listener.as_raw_fd(), false)?;
    debug!("Listener will be inherited across exec");
    Ok(())
}

#[cfg(not(unix))]
fn inherit_across_exec(_listener: &TcpListener) -> Result<()> {
    warn!("NO_CLOSE_ON_EXEC has no effect on this platform");
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_close_on_exec(fd: std::os::fd::RawFd, enabled: bool) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let current = fcntl(fd, FcntlArg::F_GETFD).map_err(std::io::Error::from)?;
    let mut flags = FdFlag::from_bits_truncate(current);
    flags.set(FdFlag::FD_CLOEXEC, enabled);
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(all(unix, test))]
fn close_on_exec(fd: std::os::fd::RawFd) -> Result<bool> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let current = fcntl(fd, FcntlArg::F_GETFD).map_err(std::io::Error::from)?;
    Ok(FdFlag::from_bits_truncate(current).contains(FdFlag::FD_CLOEXEC))
}

/// Handle to a running server. Dropping it shuts the server down.
pub struct ServerHandle {
    addr: SocketAddr,
    core: Arc<ServerCore>,
    shutdown: CancellationToken,
    namespace: Option<Namespace>,
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wire slot of a registered service, for connecting without a namespace.
    pub fn service_slot(&self, name: &str, instance: &str) -> Option<u32> {
        self.core
            .services
            .iter()
            .find(|s| s.published_name == name && s.config.instance == instance)
            .map(|s| s.id.0)
    }

    pub fn stats(&self) -> ServerStats {
        self.core.stats()
    }

    /// Active OSBs of one service.
    pub fn active_osbs(&self, id: ServiceId) -> usize {
        self.core
            .services
            .get(id.0 as usize)
            .map(|s| s.active_osbs())
            .unwrap_or(0)
    }

    pub fn osb(&self, object: ObjectRef) -> Option<OsbSnapshot> {
        self.core.osbs.snapshot(object)
    }

    pub fn is_running(&self) -> bool {
        !self.stopped
    }

    /// Stop accepting, stop dispatching, release every OSB and withdraw
    /// the published services.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.cancel();

        if let Some(ns) = &self.namespace {
            match ns.withdraw_server(std::process::id(), self.addr) {
                Ok(n) => debug!("Withdrew {} service(s) from {}", n, ns.path().display()),
                Err(e) => warn!("Failed to withdraw services: {}", e),
            }
        }
        self.core.release_all();
        info!("Server on {} stopped", self.addr);
    }

    /// Wait for the server's tasks to finish after `shutdown`.
    pub async fn wait(&mut self) {
        futures::future::join_all(self.tasks.drain(..)).await;
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("addr", &self.addr)
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespacePath;
    use async_trait::async_trait;

    struct Nop;

    #[async_trait]
    impl ServiceHandler for Nop {
        type Session = ();

        async fn open(&self, _ctx: &OpenContext) -> std::result::Result<(), i32> {
            Ok(())
        }

        async fn worker(&self, _session: Arc<()>, _request: Request) {}
    }

    fn server() -> Server {
        Server::new(ServerConfig::default().namespace(NamespacePath::Disabled))
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut server = server();
        server.register(ServiceConfig::new("a"), Nop).unwrap();
        server
            .register(ServiceConfig::new("a").instance("second"), Nop)
            .unwrap();
        let err = server.register(ServiceConfig::new("a"), Nop).unwrap_err();
        assert!(matches!(err, SvcError::DuplicateService { .. }));
    }

    #[test]
    fn test_register_capacity() {
        let mut server = Server::new(
            ServerConfig::default()
                .namespace(NamespacePath::Disabled)
                .max_services(1),
        );
        server.register(ServiceConfig::new("a"), Nop).unwrap();
        let err = server.register(ServiceConfig::new("b"), Nop).unwrap_err();
        assert!(matches!(err, SvcError::CapacityExceeded { limit: 1 }));
    }

    #[test]
    fn test_relative_names_need_domain() {
        let mut server = server();
        let relative = ServiceConfig::new("a").flags(ServiceFlags::RELATIVE_PATH);
        assert!(matches!(
            server.register(relative.clone(), Nop),
            Err(SvcError::Config { .. })
        ));

        let mut server = Server::new(
            ServerConfig::default()
                .namespace(NamespacePath::Disabled)
                .domain("acme"),
        );
        server.register(relative, Nop).unwrap();
        assert_eq!(server.services()[0].published_name(), "acme/a");
    }

    #[tokio::test]
    async fn test_external_permissions_require_manager() {
        let mut server = server();
        server
            .register(
                ServiceConfig::new("guarded").flags(ServiceFlags::EXTERNAL_PERMISSIONS),
                Nop,
            )
            .unwrap();
        assert!(matches!(server.start().await, Err(SvcError::Config { .. })));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut server = server();
        server.register(ServiceConfig::new("a"), Nop).unwrap();
        let mut handle = server.start().await.unwrap();

        assert!(handle.addr().port() > 0);
        assert_eq!(handle.service_slot("a", IpcConfig::DEFAULT_INSTANCE), Some(0));
        assert_eq!(handle.stats().services, 1);

        handle.shutdown();
        assert!(!handle.is_running());
        handle.wait().await;
    }

    #[cfg(unix)]
    #[test]
    fn test_close_on_exec_toggle() {
        use std::os::fd::AsRawFd;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        assert!(close_on_exec(fd).unwrap());
        set_close_on_exec(fd, false).unwrap();
        assert!(!close_on_exec(fd).unwrap());
    }
}
