//! Network reachability classification for sync scheduling.
//!
//! The oracle observes reachability reports from the platform, keeps a
//! bounded history of transitions to detect flapping links, and derives a
//! quality score plus a suggested delay before the next sync attempt.
//! Subscribers (the reconciler) receive the latest state on a watch channel.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Maximum retained transition timestamps.
const HISTORY_LIMIT: usize = 50;

/// Window over which transitions count toward flapping.
const FLAP_WINDOW: Duration = Duration::from_secs(60);

/// More transitions than this inside the window means the link is flapping.
const FLAP_THRESHOLD: usize = 4;

/// Debounce window after a transition before sync is encouraged.
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

/// Suggested delay while the link is flapping.
const FLAPPING_DELAY: Duration = Duration::from_secs(30);

/// Transport carrying the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Wifi,
    Ethernet,
    Cellular,
    Other,
    /// Unclassifiable transport; treated as the lowest quality.
    Unknown,
}

impl TransportType {
    /// Quality bonus contributed by the transport.
    fn quality_bonus(&self) -> f64 {
        match self {
            Self::Wifi | Self::Ethernet => 0.3,
            Self::Cellular => 0.1,
            Self::Other => 0.0,
            Self::Unknown => -0.2,
        }
    }

    /// Whether this transport is acceptable for a sync attempt.
    fn is_sync_suitable(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Snapshot of the device's network reachability. Ephemeral, not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub is_connected: bool,
    pub transport: TransportType,
    /// Metered or otherwise costly link.
    pub is_expensive: bool,
    /// Platform reports the link as data-constrained.
    pub is_constrained: bool,
}

impl ConnectivityState {
    /// Disconnected state; also the oracle's initial state.
    pub fn offline() -> Self {
        Self {
            is_connected: false,
            transport: TransportType::Unknown,
            is_expensive: false,
            is_constrained: false,
        }
    }

    /// Connected over unmetered wifi.
    pub fn wifi() -> Self {
        Self {
            is_connected: true,
            transport: TransportType::Wifi,
            is_expensive: false,
            is_constrained: false,
        }
    }

    /// Connected over cellular (expensive by default).
    pub fn cellular() -> Self {
        Self {
            is_connected: true,
            transport: TransportType::Cellular,
            is_expensive: true,
            is_constrained: false,
        }
    }
}

struct OracleInner {
    current: ConnectivityState,
    /// Timestamps of recent transitions, newest last.
    transitions: VecDeque<Instant>,
    last_transition: Option<Instant>,
}

/// Classifies reachability and advises the reconciler on sync timing.
///
/// `report` never fails; unknown transports classify as lowest quality.
pub struct ConnectivityOracle {
    inner: Mutex<OracleInner>,
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityOracle {
    /// Create an oracle starting in the disconnected state.
    pub fn new() -> Self {
        let initial = ConnectivityState::offline();
        let (tx, _rx) = watch::channel(initial);
        Self {
            inner: Mutex::new(OracleInner {
                current: initial,
                transitions: VecDeque::new(),
                last_transition: None,
            }),
            tx,
        }
    }

    /// Record a reachability report and publish it to subscribers.
    ///
    /// Identical consecutive reports are not counted as transitions.
    pub fn report(&self, state: ConnectivityState) {
        let mut inner = self.inner.lock();
        if state != inner.current {
            let now = Instant::now();
            inner.transitions.push_back(now);
            while inner.transitions.len() > HISTORY_LIMIT {
                inner.transitions.pop_front();
            }
            inner.last_transition = Some(now);
            inner.current = state;
            debug!(
                is_connected = state.is_connected,
                transport = ?state.transport,
                "Connectivity transition"
            );
            drop(inner);
            self.tx.send_replace(state);
        }
    }

    /// Get the current state.
    pub fn current(&self) -> ConnectivityState {
        self.inner.lock().current
    }

    /// Subscribe to state transitions. The receiver always holds the
    /// latest published state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Derived link quality in [0, 1].
    pub fn quality(&self) -> f64 {
        let inner = self.inner.lock();
        if !inner.current.is_connected {
            return 0.0;
        }

        let mut quality = 0.5 + inner.current.transport.quality_bonus();
        if inner.current.is_expensive {
            quality -= 0.2;
        }
        if inner.current.is_constrained {
            quality -= 0.2;
        }
        if is_flapping(&inner.transitions) {
            quality -= 0.3;
        }
        quality.clamp(0.0, 1.0)
    }

    /// Whether the link is good enough to attempt a sync.
    pub fn is_suitable_for_sync(&self) -> bool {
        let inner = self.inner.lock();
        inner.current.is_connected
            && inner.current.transport.is_sync_suitable()
            && !inner.current.is_constrained
            && !is_flapping(&inner.transitions)
    }

    /// How long to wait before syncing.
    ///
    /// Returns the remainder of the debounce window right after a
    /// transition, a longer delay while flapping, and zero once stable.
    pub fn suggested_sync_delay(&self) -> Duration {
        let inner = self.inner.lock();
        if is_flapping(&inner.transitions) {
            return FLAPPING_DELAY;
        }
        if let Some(last) = inner.last_transition {
            let elapsed = last.elapsed();
            if elapsed < DEBOUNCE_WINDOW {
                return DEBOUNCE_WINDOW - elapsed;
            }
        }
        Duration::ZERO
    }
}

impl Default for ConnectivityOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn is_flapping(transitions: &VecDeque<Instant>) -> bool {
    let now = Instant::now();
    let recent = transitions
        .iter()
        .filter(|t| now.duration_since(**t) < FLAP_WINDOW)
        .count();
    recent > FLAP_THRESHOLD
}
