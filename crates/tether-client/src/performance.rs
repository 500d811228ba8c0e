//! Performance thresholds for incoming appearances.
//!
//! Peers whose snapshots exceed the configured VRAM or triangle limits are
//! either warned about or paused locally. Peers on the ignore list are
//! never touched; sticky pairs are exempt unless the matching option is on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tether_shared::{CharacterData, EventBus, ServerId, Severity, SyncEvent, UserData};

const MIB: u64 = 1024 * 1024;
const NOTIFICATION_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    pub warn_on_exceeding_thresholds: bool,
    pub warn_on_sticky_exceeding_thresholds: bool,
    /// 0 disables.
    pub vram_warning_mib: u64,
    /// 0 disables.
    pub triangle_warning_thousands: u64,
    pub auto_pause_exceeding_thresholds: bool,
    pub auto_pause_sticky_exceeding_thresholds: bool,
    pub vram_auto_pause_mib: u64,
    pub triangle_auto_pause_thousands: u64,
    /// UIDs or aliases never warned about nor paused.
    pub ignore_list: Vec<String>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            warn_on_exceeding_thresholds: true,
            warn_on_sticky_exceeding_thresholds: false,
            vram_warning_mib: 375,
            triangle_warning_thousands: 165,
            auto_pause_exceeding_thresholds: false,
            auto_pause_sticky_exceeding_thresholds: false,
            vram_auto_pause_mib: 550,
            triangle_auto_pause_thousands: 250,
            ignore_list: Vec::new(),
        }
    }
}

/// The peer a snapshot came from.
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub server: ServerId,
    pub user: UserData,
    /// Our own permissions towards this peer carry the sticky flag.
    pub sticky: bool,
    pub player_name: Option<String>,
}

impl PeerContext {
    fn label(&self) -> String {
        match &self.player_name {
            Some(name) => format!("{} ({})", name, self.user.alias_or_uid()),
            None => self.user.alias_or_uid().to_string(),
        }
    }
}

pub trait PerformancePolicy: Send + Sync {
    fn should_auto_pause(&self, peer: &PeerContext, vram_bytes: u64, triangles: u64) -> bool;

    /// Warning text when a warning threshold is exceeded.
    fn warning_for(&self, peer: &PeerContext, vram_bytes: u64, triangles: u64) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct ThresholdPolicy {
    config: PerformanceConfig,
}

impl ThresholdPolicy {
    pub fn new(config: PerformanceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    fn is_ignored(&self, user: &UserData) -> bool {
        self.config.ignore_list.iter().any(|entry| {
            entry == &user.uid || user.alias.as_deref().is_some_and(|alias| alias == entry)
        })
    }
}

fn exceeds(enabled: bool, threshold: u64, value: u64, include_sticky: bool, sticky: bool) -> bool {
    enabled && threshold > 0 && value > threshold && (!sticky || include_sticky)
}

impl PerformancePolicy for ThresholdPolicy {
    fn should_auto_pause(&self, peer: &PeerContext, vram_bytes: u64, triangles: u64) -> bool {
        if self.is_ignored(&peer.user) {
            return false;
        }
        let c = &self.config;
        let check = |threshold: u64, value: u64| {
            exceeds(
                c.auto_pause_exceeding_thresholds,
                threshold,
                value,
                c.auto_pause_sticky_exceeding_thresholds,
                peer.sticky,
            )
        };
        check(c.vram_auto_pause_mib.saturating_mul(MIB), vram_bytes)
            || check(c.triangle_auto_pause_thousands.saturating_mul(1000), triangles)
    }

    fn warning_for(&self, peer: &PeerContext, vram_bytes: u64, triangles: u64) -> Option<String> {
        if self.is_ignored(&peer.user) {
            return None;
        }
        let c = &self.config;
        let vram_limit = c.vram_warning_mib.saturating_mul(MIB);
        let tri_limit = c.triangle_warning_thousands.saturating_mul(1000);
        let check = |threshold: u64, value: u64| {
            exceeds(
                c.warn_on_exceeding_thresholds,
                threshold,
                value,
                c.warn_on_sticky_exceeding_thresholds,
                peer.sticky,
            )
        };
        let vram = format!("{}/{} MiB", vram_bytes / MIB, c.vram_warning_mib);
        let tris = format!("{}/{} triangles", triangles, tri_limit);
        match (check(vram_limit, vram_bytes), check(tri_limit, triangles)) {
            (false, false) => None,
            (true, false) => Some(format!(
                "Player {} exceeds your configured VRAM warning threshold ({vram}).",
                peer.label()
            )),
            (false, true) => Some(format!(
                "Player {} exceeds your configured triangle warning threshold ({tris}).",
                peer.label()
            )),
            (true, true) => Some(format!(
                "Player {} exceeds both VRAM warning threshold ({vram}) and triangle warning threshold ({tris}).",
                peer.label()
            )),
        }
    }
}

/// Applies a [`PerformancePolicy`] to incoming snapshots and publishes the
/// resulting notifications and pause requests.
pub struct PerformanceGuard {
    policy: Arc<dyn PerformancePolicy>,
    bus: EventBus,
    /// UID -> whether the last check warned. Warnings repeat only after a
    /// peer drops back under the limits.
    warned: Mutex<HashMap<String, bool>>,
}

impl PerformanceGuard {
    pub fn new(policy: Arc<dyn PerformancePolicy>, bus: EventBus) -> Self {
        Self {
            policy,
            bus,
            warned: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `false` when the peer was paused and the snapshot should not
    /// be applied.
    pub fn check(&self, peer: &PeerContext, data: &CharacterData) -> bool {
        let vram = data.player_vram_bytes();
        let triangles = data.player_triangles();
        debug!(server = %peer.server, uid = %peer.user.uid, vram, triangles, "Checking thresholds");

        if self.policy.should_auto_pause(peer, vram, triangles) {
            info!(server = %peer.server, uid = %peer.user.uid, "Auto-pausing peer");
            self.bus.publish(SyncEvent::notification(
                format!("{} automatically paused", peer.label()),
                format!(
                    "Player {} exceeded your configured auto pause thresholds ({} MiB, {} triangles) and has been automatically paused.",
                    peer.label(),
                    vram / MIB,
                    triangles
                ),
                Severity::Warning,
                NOTIFICATION_DURATION,
            ));
            self.bus.publish(SyncEvent::PausePeer {
                server: peer.server,
                user: peer.user.clone(),
            });
            return false;
        }

        let warning = self.policy.warning_for(peer, vram, triangles);
        let already_warned = {
            let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
            warned
                .insert(peer.user.uid.clone(), warning.is_some())
                .unwrap_or(false)
        };
        if let (Some(body), false) = (warning, already_warned) {
            self.bus.publish(SyncEvent::notification(
                format!("{} exceeds performance threshold(s)", peer.label()),
                body,
                Severity::Warning,
                NOTIFICATION_DURATION,
            ));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_shared::{CharacterContent, FileReplacement, ObjectKind};

    fn peer(uid: &str, sticky: bool) -> PeerContext {
        PeerContext {
            server: ServerId::new(),
            user: UserData::with_alias(uid, format!("{uid}-alias")),
            sticky,
            player_name: Some("Somebody".into()),
        }
    }

    fn pausing() -> PerformanceConfig {
        PerformanceConfig {
            auto_pause_exceeding_thresholds: true,
            vram_auto_pause_mib: 100,
            triangle_auto_pause_thousands: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_auto_pause_over_either_threshold() {
        let policy = ThresholdPolicy::new(pausing());
        let p = peer("U1", false);
        assert!(!policy.should_auto_pause(&p, 100 * MIB, 50_000));
        assert!(policy.should_auto_pause(&p, 100 * MIB + 1, 0));
        assert!(policy.should_auto_pause(&p, 0, 50_001));
    }

    #[test]
    fn test_zero_threshold_disables() {
        let policy = ThresholdPolicy::new(PerformanceConfig {
            vram_auto_pause_mib: 0,
            triangle_auto_pause_thousands: 0,
            ..pausing()
        });
        assert!(!policy.should_auto_pause(&peer("U1", false), u64::MAX, u64::MAX));
    }

    #[test]
    fn test_precedence_ignore_then_sticky() {
        let mut config = pausing();
        config.ignore_list = vec!["U2-alias".into()];
        config.auto_pause_sticky_exceeding_thresholds = true;
        let policy = ThresholdPolicy::new(config);

        // Ignored by alias even though sticky pausing is enabled.
        assert!(!policy.should_auto_pause(&peer("U2", true), u64::MAX, u64::MAX));
        assert!(policy.should_auto_pause(&peer("U3", true), u64::MAX, 0));

        let policy = ThresholdPolicy::new(pausing());
        assert!(!policy.should_auto_pause(&peer("U3", true), u64::MAX, 0));
    }

    #[test]
    fn test_warning_text() {
        let policy = ThresholdPolicy::new(PerformanceConfig {
            vram_warning_mib: 10,
            triangle_warning_thousands: 1,
            ..Default::default()
        });
        let p = peer("U1", false);
        assert!(policy.warning_for(&p, 10 * MIB, 1000).is_none());
        let both = policy.warning_for(&p, 20 * MIB, 2000).unwrap();
        assert!(both.contains("both VRAM"));
        assert!(both.contains("20/10 MiB"));
        let tris = policy.warning_for(&p, 0, 2000).unwrap();
        assert!(tris.contains("triangle warning threshold (2000/1000 triangles)"));
    }

    fn heavy_snapshot() -> CharacterData {
        let mut content = CharacterContent::default();
        let mut r = FileReplacement::from_hash("AA", ["chara/body.mdl"]);
        r.vram_bytes = Some(600 * MIB);
        r.triangles = Some(10);
        content.file_replacements.insert(ObjectKind::Player, vec![r]);
        CharacterData::from_content(content).unwrap()
    }

    #[tokio::test]
    async fn test_guard_publishes_pause() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let guard = PerformanceGuard::new(Arc::new(ThresholdPolicy::new(pausing())), bus);
        let p = peer("U1", false);

        assert!(!guard.check(&p, &heavy_snapshot()));
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::Notification { severity: Severity::Warning, .. })
        ));
        match events.recv().await {
            Some(SyncEvent::PausePeer { server, user }) => {
                assert_eq!(server, p.server);
                assert_eq!(user.uid, "U1");
            }
            other => panic!("expected pause, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_guard_warns_once_until_back_under() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let guard = PerformanceGuard::new(Arc::new(ThresholdPolicy::default()), bus);
        let p = peer("U1", false);
        let heavy = heavy_snapshot();

        assert!(guard.check(&p, &heavy));
        assert!(guard.check(&p, &heavy));
        assert!(events.try_recv().is_some());
        assert!(events.try_recv().is_none());

        let light = CharacterData::from_content(CharacterContent::default()).unwrap();
        assert!(guard.check(&p, &light));
        assert!(guard.check(&p, &heavy));
        assert!(events.try_recv().is_some());
    }
}
