//! Per-connection heartbeat monitor.
//!
//! Tracks when the connection last read and wrote, and tells the owning
//! task when a heartbeat is due or when the peer has been silent for too
//! long. The monitor owns no task; it is polled from the connection's
//! `select!` loop through [`HeartbeatMonitor::tick`] and stops with it.

use std::time::Duration;

use relaymq_protocol::stomp::HeartbeatSettings;
use tokio::time::{Instant, sleep_until};

/// What the connection has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Nothing was written for a full outgoing interval; send a heartbeat.
    SendHeartbeat,
    /// Nothing was read within the allowed window; close the connection.
    TimedOut {
        /// Time since the last read.
        idle: Duration,
    },
}

/// Read/write liveness timers for one connection.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    send_interval: Option<Duration>,
    read_timeout: Option<Duration>,
    last_read: Instant,
    last_write: Instant,
}

impl HeartbeatMonitor {
    /// Creates a monitor from negotiated settings seen from the server:
    /// `outgoing_ms` is the send cadence, `incoming_ms` the interval the
    /// client promised. The peer is dropped after `incoming × multiplier`
    /// of silence.
    pub fn new(settings: HeartbeatSettings, timeout_multiplier: u32) -> Self {
        let now = Instant::now();
        Self {
            send_interval: settings.outgoing(),
            read_timeout: settings
                .incoming()
                .map(|interval| interval.saturating_mul(timeout_multiplier.max(1))),
            last_read: now,
            last_write: now,
        }
    }

    /// A monitor that never fires.
    pub fn disabled() -> Self {
        Self::new(HeartbeatSettings::DISABLED, 1)
    }

    /// Returns true if neither timer is armed.
    pub fn is_disabled(&self) -> bool {
        self.send_interval.is_none() && self.read_timeout.is_none()
    }

    /// Window of silence tolerated from the peer.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Cadence of outgoing heartbeats.
    pub fn send_interval(&self) -> Option<Duration> {
        self.send_interval
    }

    /// Records that something (frame or heartbeat) was read.
    pub fn record_read(&mut self) {
        self.last_read = Instant::now();
    }

    /// Records that something was written.
    pub fn record_write(&mut self) {
        self.last_write = Instant::now();
    }

    fn next_deadline(&self) -> Option<Instant> {
        let read = self.read_timeout.map(|timeout| self.last_read + timeout);
        let write = self.send_interval.map(|interval| self.last_write + interval);
        match (read, write) {
            (Some(read), Some(write)) => Some(read.min(write)),
            (deadline, None) | (None, deadline) => deadline,
        }
    }

    /// Returns the event due at `now`, if any.
    ///
    /// A read timeout takes precedence over a due heartbeat.
    pub fn poll_due(&self, now: Instant) -> Option<HeartbeatEvent> {
        if let Some(timeout) = self.read_timeout {
            let idle = now.saturating_duration_since(self.last_read);
            if idle >= timeout {
                return Some(HeartbeatEvent::TimedOut { idle });
            }
        }
        if let Some(interval) = self.send_interval
            && now.saturating_duration_since(self.last_write) >= interval
        {
            return Some(HeartbeatEvent::SendHeartbeat);
        }
        None
    }

    /// Waits until an event is due. Pends forever when disabled.
    ///
    /// Cancel safe: dropping the future leaves the monitor unchanged.
    pub async fn tick(&self) -> HeartbeatEvent {
        loop {
            let Some(deadline) = self.next_deadline() else {
                return std::future::pending().await;
            };
            sleep_until(deadline).await;
            if let Some(event) = self.poll_due(Instant::now()) {
                return event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn disabled_monitor_never_fires() {
        let monitor = HeartbeatMonitor::disabled();
        assert!(monitor.is_disabled());
        let fired = tokio::time::timeout(Duration::from_secs(3600), monitor.tick()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_uses_multiplier() {
        let monitor = HeartbeatMonitor::new(HeartbeatSettings::new(0, 500), 2);
        assert_eq!(monitor.read_timeout(), Some(Duration::from_millis(1000)));

        let start = Instant::now();
        let HeartbeatEvent::TimedOut { idle } = monitor.tick().await else {
            panic!("expected a timeout");
        };
        assert!(idle >= Duration::from_millis(1000));
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn reads_push_the_deadline_out() {
        let mut monitor = HeartbeatMonitor::new(HeartbeatSettings::new(0, 500), 2);
        for _ in 0..5 {
            advance(Duration::from_millis(800)).await;
            assert_eq!(monitor.poll_due(Instant::now()), None);
            monitor.record_read();
        }
        advance(Duration::from_millis(1000)).await;
        assert!(matches!(
            monitor.poll_due(Instant::now()),
            Some(HeartbeatEvent::TimedOut { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_due_after_idle_write_interval() {
        let mut monitor = HeartbeatMonitor::new(HeartbeatSettings::new(500, 0), 2);
        let start = Instant::now();
        assert_eq!(monitor.tick().await, HeartbeatEvent::SendHeartbeat);
        assert!(start.elapsed() >= Duration::from_millis(500));

        monitor.record_write();
        advance(Duration::from_millis(300)).await;
        monitor.record_write();
        assert_eq!(monitor.poll_due(Instant::now()), None);
        assert_eq!(monitor.tick().await, HeartbeatEvent::SendHeartbeat);
        assert!(start.elapsed() >= Duration::from_millis(1300));
    }

    #[test]
    fn zero_multiplier_is_treated_as_one() {
        let monitor = HeartbeatMonitor::new(HeartbeatSettings::new(0, 500), 0);
        assert_eq!(monitor.read_timeout(), Some(Duration::from_millis(500)));
    }
}
