//! Which server applies a player's appearance when the same player is
//! visible through several servers at once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tether_shared::ServerId;

/// First server to claim a player-name hash owns it until it releases.
#[derive(Debug, Default)]
pub struct RenderLocks {
    owners: DashMap<String, ServerId>,
}

impl RenderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `player` for `server` and return the owning server, which is
    /// `server` itself only if nobody held the lock. `None` for blank
    /// names or the nil server.
    pub fn acquire(&self, player: &str, server: ServerId) -> Option<ServerId> {
        if player.trim().is_empty() || server.is_nil() {
            return None;
        }
        Some(*self.owners.entry(player.to_string()).or_insert(server))
    }

    /// Release `player` if `server` owns it.
    pub fn release(&self, player: &str, server: ServerId) -> bool {
        if player.trim().is_empty() || server.is_nil() {
            return false;
        }
        match self.owners.entry(player.to_string()) {
            Entry::Occupied(owner) if *owner.get() == server => {
                owner.remove();
                true
            }
            _ => false,
        }
    }

    pub fn owner(&self, player: &str) -> Option<ServerId> {
        self.owners.get(player).map(|o| *o)
    }

    /// Drop every lock held by `server`.
    pub fn release_all(&self, server: ServerId) {
        self.owners.retain(|_, owner| *owner != server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_claim_wins() {
        let locks = RenderLocks::new();
        let (a, b) = (ServerId::new(), ServerId::new());
        assert_eq!(locks.acquire("HASH", a), Some(a));
        assert_eq!(locks.acquire("HASH", b), Some(a));
        assert!(!locks.release("HASH", b));
        assert!(locks.release("HASH", a));
        assert_eq!(locks.acquire("HASH", b), Some(b));
    }

    #[test]
    fn test_blank_and_nil_rejected() {
        let locks = RenderLocks::new();
        assert_eq!(locks.acquire("  ", ServerId::new()), None);
        assert_eq!(locks.acquire("HASH", ServerId::nil()), None);
        assert!(locks.owner("HASH").is_none());
    }

    #[test]
    fn test_release_all_for_server() {
        let locks = RenderLocks::new();
        let (a, b) = (ServerId::new(), ServerId::new());
        locks.acquire("P1", a);
        locks.acquire("P2", a);
        locks.acquire("P3", b);
        locks.release_all(a);
        assert!(locks.owner("P1").is_none());
        assert_eq!(locks.owner("P3"), Some(b));
    }
}
