//! SQLite-backed service namespace.
//!
//! Servers publish each registered (name, instance) pair together with the
//! loopback address that reaches it; clients resolve the pair before they
//! connect. The database is per user by default, which makes it the
//! security domain boundary:
//!
//! - **Linux**: `$XDG_RUNTIME_DIR/svcmsg/namespace.db` (falls back to the cache dir)
//! - **macOS**: `~/Library/Caches/svcmsg/namespace.db`
//! - **Windows**: `%LOCALAPPDATA%\svcmsg\namespace.db`
//!
//! Applications may pass an absolute database path instead.

use crate::config::{NamespaceConfig, NamespacePath};
use crate::{Result, SvcError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A published service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub instance: String,
    pub addr: SocketAddr,
    pub pid: u32,
    pub service_slot: u32,
    pub capabilities: String,
    pub min_len: u32,
    pub registered_at: String,
}

/// Handle to a namespace database.
///
/// Uses WAL mode for safe access across processes and
/// `Arc<Mutex<Connection>>` within a process.
#[derive(Clone)]
pub struct Namespace {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("path", &self.path).finish()
    }
}

/// Per-user default database path.
pub fn default_namespace_path() -> Result<PathBuf> {
    let base = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or_else(|| SvcError::Config {
            message: "Could not determine a runtime or cache directory".to_string(),
        })?;
    Ok(base
        .join(NamespaceConfig::DIR_NAME)
        .join(NamespaceConfig::DB_FILE_NAME))
}

/// Check whether a process is still running.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0 only probes; EPERM means the process exists under another user.
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

impl Namespace {
    /// Open the namespace named by `path`; `Disabled` yields `None`.
    pub fn open_path(path: &NamespacePath) -> Result<Option<Self>> {
        match path {
            NamespacePath::Default => Self::open().map(Some),
            NamespacePath::Absolute(p) => Self::open_at(p).map(Some),
            NamespacePath::Disabled => Ok(None),
        }
    }

    /// Open the namespace at the default per-user location.
    pub fn open() -> Result<Self> {
        let db_path = default_namespace_path()?;
        Self::open_at(&db_path)
    }

    /// Open the namespace at a specific path, creating it if needed.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| SvcError::Io {
                    message: format!(
                        "Failed to create namespace directory: {}",
                        parent.display()
                    ),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        // Surface access-control refusals before SQLite turns them into a
        // generic "unable to open" error.
        if db_path.exists() {
            if let Err(e) = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(db_path)
            {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    return Err(SvcError::PermissionDenied {
                        service: db_path.display().to_string(),
                    });
                }
                return Err(SvcError::io_with_path(e, db_path));
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;",
            NamespaceConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS services (
                name TEXT NOT NULL,
                instance TEXT NOT NULL,
                addr TEXT NOT NULL,
                pid INTEGER NOT NULL,
                service_slot INTEGER NOT NULL,
                capabilities TEXT NOT NULL DEFAULT '',
                min_len INTEGER NOT NULL DEFAULT 0,
                registered_at TEXT NOT NULL,
                PRIMARY KEY (name, instance)
            );",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SvcError::Database {
            message: "Failed to acquire namespace connection lock".to_string(),
            source: None,
        })
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ServiceEntry, String)> {
        let addr: String = row.get(2)?;
        Ok((
            ServiceEntry {
                name: row.get(0)?,
                instance: row.get(1)?,
                addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                pid: row.get(3)?,
                service_slot: row.get(4)?,
                capabilities: row.get(5)?,
                min_len: row.get(6)?,
                registered_at: row.get(7)?,
            },
            addr,
        ))
    }

    fn finish_entry((mut entry, addr): (ServiceEntry, String)) -> Result<ServiceEntry> {
        entry.addr = addr.parse().map_err(|_| SvcError::Database {
            message: format!("Corrupt address for {}: {}", entry.name, addr),
            source: None,
        })?;
        Ok(entry)
    }

    /// Publish a service entry.
    ///
    /// Fails with `DuplicateService` if a live process other than the
    /// caller already owns the (name, instance) pair; entries left behind by
    /// dead processes are replaced.
    pub fn publish(&self, entry: &ServiceEntry) -> Result<()> {
        let conn = self.lock_conn()?;

        let owner: Option<u32> = conn
            .query_row(
                "SELECT pid FROM services WHERE name = ?1 AND instance = ?2",
                params![entry.name, entry.instance],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(pid) = owner {
            if pid != entry.pid && is_process_alive(pid) {
                return Err(SvcError::DuplicateService {
                    name: entry.name.clone(),
                    instance: entry.instance.clone(),
                });
            }
        }

        conn.execute(
            "INSERT INTO services (name, instance, addr, pid, service_slot, capabilities, min_len, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name, instance) DO UPDATE SET
                 addr=excluded.addr,
                 pid=excluded.pid,
                 service_slot=excluded.service_slot,
                 capabilities=excluded.capabilities,
                 min_len=excluded.min_len,
                 registered_at=excluded.registered_at",
            params![
                entry.name,
                entry.instance,
                entry.addr.to_string(),
                entry.pid,
                entry.service_slot,
                entry.capabilities,
                entry.min_len,
                entry.registered_at,
            ],
        )?;

        debug!(
            "Published {}/{} at {} (PID {})",
            entry.name, entry.instance, entry.addr, entry.pid
        );
        Ok(())
    }

    /// Build an entry stamped with the current time.
    pub fn entry(
        name: &str,
        instance: &str,
        addr: SocketAddr,
        service_slot: u32,
        capabilities: &str,
        min_len: u32,
    ) -> ServiceEntry {
        ServiceEntry {
            name: name.to_string(),
            instance: instance.to_string(),
            addr,
            pid: std::process::id(),
            service_slot,
            capabilities: capabilities.to_string(),
            min_len,
            registered_at: Utc::now().to_rfc3339(),
        }
    }

    /// Remove one entry if `pid` still owns it.
    pub fn withdraw(&self, name: &str, instance: &str, pid: u32) -> Result<bool> {
        let conn = self.lock_conn()?;
        let rows = conn.execute(
            "DELETE FROM services WHERE name = ?1 AND instance = ?2 AND pid = ?3",
            params![name, instance, pid],
        )?;
        if rows > 0 {
            debug!("Withdrew {}/{}", name, instance);
        }
        Ok(rows > 0)
    }

    /// Remove every entry owned by `pid` and listening on `addr`.
    pub fn withdraw_server(&self, pid: u32, addr: SocketAddr) -> Result<usize> {
        let conn = self.lock_conn()?;
        let rows = conn.execute(
            "DELETE FROM services WHERE pid = ?1 AND addr = ?2",
            params![pid, addr.to_string()],
        )?;
        Ok(rows)
    }

    /// Look up a service; stale entries of dead processes are pruned.
    pub fn resolve(&self, name: &str, instance: &str) -> Result<Option<ServiceEntry>> {
        let found = {
            let conn = self.lock_conn()?;
            conn.query_row(
                "SELECT name, instance, addr, pid, service_slot, capabilities, min_len, registered_at
                 FROM services WHERE name = ?1 AND instance = ?2",
                params![name, instance],
                Self::row_to_entry,
            )
            .optional()?
        };

        let Some(raw) = found else {
            return Ok(None);
        };
        let entry = Self::finish_entry(raw)?;

        if !is_process_alive(entry.pid) {
            warn!(
                "Pruning stale namespace entry {}/{} (PID {} is gone)",
                entry.name, entry.instance, entry.pid
            );
            self.withdraw(&entry.name, &entry.instance, entry.pid)?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// List all published services, most recently registered first.
    pub fn list(&self) -> Result<Vec<ServiceEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, instance, addr, pid, service_slot, capabilities, min_len, registered_at
             FROM services ORDER BY registered_at DESC, name ASC",
        )?;
        let raw: Vec<(ServiceEntry, String)> = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        raw.into_iter().map(Self::finish_entry).collect()
    }

    /// Remove entries whose owning process has exited.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT name, instance, pid FROM services")?;
        let entries: Vec<(String, String, u32)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut removed = 0;
        for (name, instance, pid) in &entries {
            if !is_process_alive(*pid) {
                conn.execute(
                    "DELETE FROM services WHERE name = ?1 AND instance = ?2 AND pid = ?3",
                    params![name, instance, pid],
                )?;
                removed += 1;
                debug!("Cleaned up stale service {}/{} (PID {})", name, instance, pid);
            }
        }
        Ok(removed)
    }
}
