//! Ping/pong liveness probing for a single connection.
//!
//! A [`Heartbeat`] is owned by the task driving a connection and polled
//! inside its `select!` loop. Each tick either asks the caller to send a
//! ping or reports that the previous ping went unanswered, in which case
//! the caller terminates the connection without probing again.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// What the connection task should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The peer answered the last ping; send another one.
    Ping,
    /// No pong arrived since the last ping; the peer is dead.
    Expired,
}

/// Liveness flag plus the probe timer for one connection.
pub struct Heartbeat {
    alive: bool,
    ticker: Interval,
}

impl Heartbeat {
    /// Start a heartbeat whose first probe fires one `interval` from now.
    pub fn new(interval: Duration) -> Self {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            alive: true,
            ticker,
        }
    }

    /// Wait for the next tick and decide whether to probe or give up.
    ///
    /// Cancel-safe: the liveness flag only changes after the timer fires.
    pub async fn tick(&mut self) -> Probe {
        self.ticker.tick().await;
        if !self.alive {
            return Probe::Expired;
        }
        self.alive = false;
        Probe::Ping
    }

    /// Record a pong from the peer.
    pub fn record_pong(&mut self) {
        self.alive = true;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(20);

    #[tokio::test(start_paused = true)]
    async fn first_probe_waits_one_interval() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(INTERVAL);

        assert_eq!(heartbeat.tick().await, Probe::Ping);
        assert_eq!(start.elapsed(), INTERVAL);
        assert!(!heartbeat.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_expires_on_next_tick() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(INTERVAL);

        assert_eq!(heartbeat.tick().await, Probe::Ping);
        assert_eq!(heartbeat.tick().await, Probe::Expired);
        assert_eq!(start.elapsed(), INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_keeps_connection_alive() {
        let mut heartbeat = Heartbeat::new(INTERVAL);

        for _ in 0..5 {
            assert_eq!(heartbeat.tick().await, Probe::Ping);
            heartbeat.record_pong();
        }
        assert!(heartbeat.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_after_expiry_window_does_not_revive() {
        let mut heartbeat = Heartbeat::new(INTERVAL);

        assert_eq!(heartbeat.tick().await, Probe::Ping);
        assert_eq!(heartbeat.tick().await, Probe::Expired);
        assert!(!heartbeat.is_alive());
    }
}
