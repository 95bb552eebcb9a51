//! Data store reachability latch.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Tracks whether the data store is reachable.
pub struct Connectivity {
    online: AtomicBool,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record the current reachability. Returns true when this call moved
    /// the latch from offline to online.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return false;
        }

        if online {
            info!("Data store reachable again");
        } else {
            warn!("Data store unreachable, mutations will be queued");
        }
        online
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_only_offline_to_online_transitions() {
        let latch = Connectivity::new(true);
        assert!(!latch.set_online(true));
        assert!(!latch.set_online(false));
        assert!(!latch.is_online());
        assert!(!latch.set_online(false));
        assert!(latch.set_online(true));
        assert!(latch.is_online());
    }
}
