//! Connection liveness clocks.
//!
//! A peer that has sent nothing for a quarter of the configured timeout gets
//! a `ready` probe; a peer we have heard nothing from for twice the timeout
//! is declared dead. The probe goes out below the command queue so a gated
//! command cannot starve liveness.

use std::time::{Duration, Instant};

/// Timing policy shared by every connection of a process.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// The configured peer timeout.
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(60) }
    }
}

impl KeepaliveConfig {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Idle-send threshold before a probe goes out.
    pub fn probe_after(&self) -> Duration {
        self.timeout / 4
    }

    /// Idle-receive threshold before the connection is declared dead.
    pub fn dead_after(&self) -> Duration {
        self.timeout * 2
    }
}

/// What the idle sweep should do for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    None,
    /// Send a `ready` probe.
    Probe,
    /// Treat the connection as failed.
    Dead,
}

/// Last-traffic timestamps for one connection.
#[derive(Debug, Clone)]
pub struct KeepaliveClock {
    last_send: Instant,
    last_recv: Instant,
}

impl KeepaliveClock {
    pub fn new(now: Instant) -> Self {
        Self { last_send: now, last_recv: now }
    }

    pub fn sent(&mut self, now: Instant) {
        self.last_send = now;
    }

    pub fn received(&mut self, now: Instant) {
        self.last_recv = now;
    }

    pub fn poll(&self, now: Instant, config: &KeepaliveConfig) -> KeepaliveAction {
        if now.duration_since(self.last_recv) >= config.dead_after() {
            KeepaliveAction::Dead
        } else if now.duration_since(self.last_send) >= config.probe_after() {
            KeepaliveAction::Probe
        } else {
            KeepaliveAction::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_connection_gets_probed_then_dies() {
        let config = KeepaliveConfig::new(Duration::from_secs(40));
        let start = Instant::now();
        let clock = KeepaliveClock::new(start);

        assert_eq!(clock.poll(start + Duration::from_secs(5), &config), KeepaliveAction::None);
        assert_eq!(clock.poll(start + Duration::from_secs(10), &config), KeepaliveAction::Probe);
        assert_eq!(clock.poll(start + Duration::from_secs(80), &config), KeepaliveAction::Dead);
    }

    #[test]
    fn inbound_traffic_defers_death_but_not_probe() {
        let config = KeepaliveConfig::new(Duration::from_secs(40));
        let start = Instant::now();
        let mut clock = KeepaliveClock::new(start);

        clock.received(start + Duration::from_secs(70));
        // We heard from the peer recently, but sent nothing for a while:
        // still our turn to probe.
        assert_eq!(clock.poll(start + Duration::from_secs(75), &config), KeepaliveAction::Probe);

        clock.sent(start + Duration::from_secs(75));
        assert_eq!(clock.poll(start + Duration::from_secs(76), &config), KeepaliveAction::None);
    }
}
