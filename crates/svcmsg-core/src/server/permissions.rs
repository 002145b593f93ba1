//! Access checks for services registered with `ServiceFlags::EXTERNAL_PERMISSIONS`.

use super::descriptor::ServiceConfig;
use crate::config::OpenFlags;
use crate::message::PeerCredentials;
use std::collections::HashSet;

/// Server-wide access policy consulted on OPEN.
pub trait PermissionManager: Send + Sync + 'static {
    fn check(&self, service: &ServiceConfig, peer: &PeerCredentials, flags: OpenFlags) -> bool;
}

/// Allows peers running as the same user as the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameUser;

impl PermissionManager for SameUser {
    fn check(&self, _service: &ServiceConfig, peer: &PeerCredentials, _flags: OpenFlags) -> bool {
        let own = PeerCredentials::current();
        match (own.uid, peer.uid) {
            (Some(own), Some(theirs)) => own == theirs,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}

/// Allows an explicit set of user ids; write access can be limited further.
#[derive(Debug, Clone, Default)]
pub struct UidAllowList {
    readers: HashSet<u32>,
    writers: HashSet<u32>,
}

impl UidAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_read(mut self, uid: u32) -> Self {
        self.readers.insert(uid);
        self
    }

    /// Write access implies read access.
    pub fn allow_write(mut self, uid: u32) -> Self {
        self.readers.insert(uid);
        self.writers.insert(uid);
        self
    }
}

impl PermissionManager for UidAllowList {
    fn check(&self, _service: &ServiceConfig, peer: &PeerCredentials, flags: OpenFlags) -> bool {
        let Some(uid) = peer.uid else {
            return false;
        };
        if flags.intersects(OpenFlags::WRITE | OpenFlags::EXCLUSIVE) {
            self.writers.contains(&uid)
        } else {
            self.readers.contains(&uid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(uid: Option<u32>) -> PeerCredentials {
        PeerCredentials { pid: 42, uid }
    }

    #[test]
    fn test_same_user_accepts_own_credentials() {
        let config = ServiceConfig::new("svc");
        let own = PeerCredentials::current();
        assert!(SameUser.check(&config, &own, OpenFlags::READ));
    }

    #[test]
    fn test_allow_list_separates_read_and_write() {
        let config = ServiceConfig::new("svc");
        let list = UidAllowList::new().allow_read(10).allow_write(20);

        assert!(list.check(&config, &peer(Some(10)), OpenFlags::READ));
        assert!(!list.check(&config, &peer(Some(10)), OpenFlags::WRITE));
        assert!(list.check(&config, &peer(Some(20)), OpenFlags::READ | OpenFlags::WRITE));
        assert!(!list.check(&config, &peer(Some(30)), OpenFlags::READ));
        assert!(!list.check(&config, &peer(None), OpenFlags::READ));
    }
}
