//! Centralized configuration for svcmsg.
//!
//! Constant tables follow the `XxxConfig::CONST` pattern; runtime knobs live
//! in `ServerConfig` and `TimeoutPolicy`, both with sensible defaults.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Substrate-wide constants.
pub struct IpcConfig;

impl IpcConfig {
    /// Upper bound for one frame (header plus payload).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    /// Upper bound for the JSON header part of a frame.
    pub const MAX_HEADER_SIZE: usize = 64 * 1024;
    /// Largest payload that always fits in a frame next to its header.
    pub const MAX_PAYLOAD_SIZE: usize = Self::MAX_MESSAGE_SIZE - Self::MAX_HEADER_SIZE;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long `Connection::close` waits for the server to acknowledge.
    pub const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(2);
    pub const DEFAULT_INSTANCE: &'static str = "default";
    pub const MAX_SERVICES: usize = 64;
    pub const DEFAULT_DISPATCH_THREADS: usize = 4;
    pub const DEFAULT_MAX_OSBS: usize = 1024;
    pub const DEFAULT_MAX_PENDING_REPLIES: usize = 64;
    /// Maximum concurrent client connections per server.
    pub const MAX_CONNECTIONS: usize = 4096;
    /// Depth of the shared dispatch queue before readers apply backpressure.
    pub const DISPATCH_QUEUE_DEPTH: usize = 1024;
}

/// Namespace database location and tuning.
pub struct NamespaceConfig;

impl NamespaceConfig {
    pub const DIR_NAME: &'static str = "svcmsg";
    pub const DB_FILE_NAME: &'static str = "namespace.db";
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
}

bitflags! {
    /// Server-wide behaviour switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServerFlags: u32 {
        /// Readers enqueue CLOSE themselves instead of going through the
        /// dedicated disconnect-watcher task.
        const NO_DISCONNECT_WATCHER = 1 << 0;
        /// Clear close-on-exec on the listener so exec'd children inherit it.
        const NO_CLOSE_ON_EXEC = 1 << 1;
    }
}

bitflags! {
    /// Per-service registration switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ServiceFlags: u32 {
        /// Defer OPEN authorization to the server's `PermissionManager`.
        const EXTERNAL_PERMISSIONS = 1 << 0;
        /// Publish the name relative to the server's domain prefix.
        const RELATIVE_PATH = 1 << 1;
    }
}

bitflags! {
    /// Flags a client passes on OPEN; forwarded to `open` and `authorize`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXCLUSIVE = 1 << 2;
    }
}

/// Where the service namespace lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NamespacePath {
    /// Per-user database under the runtime (or cache) directory.
    #[default]
    Default,
    /// Application-supplied database path.
    Absolute(PathBuf),
    /// Do not publish; clients must be given the address directly.
    Disabled,
}

/// Runtime configuration for a `Server`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub dispatch_threads: usize,
    pub flags: ServerFlags,
    pub namespace: NamespacePath,
    /// Prefix for services registered with `ServiceFlags::RELATIVE_PATH`.
    pub domain: Option<String>,
    pub max_services: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dispatch_threads: IpcConfig::DEFAULT_DISPATCH_THREADS,
            flags: ServerFlags::empty(),
            namespace: NamespacePath::Default,
            domain: None,
            max_services: IpcConfig::MAX_SERVICES,
        }
    }
}

impl ServerConfig {
    pub fn dispatch_threads(mut self, n: usize) -> Self {
        self.dispatch_threads = n.max(1);
        self
    }

    pub fn flags(mut self, flags: ServerFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn namespace(mut self, namespace: NamespacePath) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn max_services(mut self, max: usize) -> Self {
        self.max_services = max;
        self
    }
}

/// Clock used to compute request deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// Immune to wall-clock changes.
    #[default]
    Monotonic,
    /// Deadline is fixed against wall-clock time when the call starts and
    /// re-checked against the wall clock every time the timer fires.
    Realtime,
}

/// Client-side timeout policy for GET/PUTGET/PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutPolicy {
    pub clock: ClockSource,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    /// Allowed lateness of the timer. The call never times out before
    /// `timeout` and gives up no later than `timeout + tolerance`.
    pub tolerance: Duration,
}

impl TimeoutPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    /// Time left to wait, measured from a call started at `started`
    /// (monotonic) or `wall_start` (realtime).
    ///
    /// Returns `None` when the policy waits forever, including a budget too
    /// large to represent.
    pub fn remaining(&self, started: tokio::time::Instant, wall_start: SystemTime) -> Option<Duration> {
        let budget = self.timeout?.checked_add(self.tolerance)?;
        let elapsed = match self.clock {
            ClockSource::Monotonic => started.elapsed(),
            ClockSource::Realtime => SystemTime::now()
                .duration_since(wall_start)
                .unwrap_or(Duration::ZERO),
        };
        Some(budget.saturating_sub(elapsed))
    }
}
