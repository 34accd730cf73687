//! Connection liveness tracking.
//!
//! Two independent deadlines over one connection: a read-idle timeout (no
//! bytes received for too long means the peer is dead) and a write-idle
//! interval (quiet on our side triggers a HEART_BEAT probe). Probes that go
//! unanswered accumulate; past the limit the connection is closed.
//!
//! The monitor is pure state driven by explicit instants, so the connection
//! task can sleep until [`next_deadline`](HeartbeatMonitor::next_deadline)
//! and the logic stays testable without a clock.

use std::time::Duration;

use tokio::time::Instant;

use crate::constants::{HEARTBEAT_INTERVAL, MAX_MISSED_HEARTBEATS, READ_IDLE_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send one HEART_BEAT probe.
    SendProbe,
    /// Close the connection; the peer went silent.
    Close(CloseCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    ReadIdle,
    MissedHeartbeats,
}

pub struct HeartbeatMonitor {
    read_idle: Duration,
    write_interval: Duration,
    max_missed: u32,
    last_read: Instant,
    last_write: Instant,
    missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(now: Instant) -> Self {
        Self::with_limits(now, READ_IDLE_TIMEOUT, HEARTBEAT_INTERVAL, MAX_MISSED_HEARTBEATS)
    }

    pub fn with_limits(
        now: Instant,
        read_idle: Duration,
        write_interval: Duration,
        max_missed: u32,
    ) -> Self {
        Self {
            read_idle,
            write_interval,
            max_missed,
            last_read: now,
            last_write: now,
            missed: 0,
        }
    }

    /// Bytes arrived from the peer.
    pub fn on_read(&mut self, now: Instant) {
        self.last_read = now;
    }

    /// Bytes were written to the peer.
    pub fn on_write(&mut self, now: Instant) {
        self.last_write = now;
    }

    /// A HEART_BEAT response arrived; the probe counter starts over.
    pub fn on_heartbeat_reply(&mut self, now: Instant) {
        self.last_read = now;
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Earliest instant at which [`poll`](Self::poll) can produce an action.
    pub fn next_deadline(&self) -> Instant {
        (self.last_read + self.read_idle).min(self.last_write + self.write_interval)
    }

    /// Evaluate both timers at `now`. At most one action is returned per
    /// call; a fired write-idle timer counts as one missed probe.
    pub fn poll(&mut self, now: Instant) -> Option<HeartbeatAction> {
        if now >= self.last_read + self.read_idle {
            return Some(HeartbeatAction::Close(CloseCause::ReadIdle));
        }
        if now >= self.last_write + self.write_interval {
            self.missed += 1;
            if self.missed > self.max_missed {
                return Some(HeartbeatAction::Close(CloseCause::MissedHeartbeats));
            }
            // The probe the caller sends will push last_write forward.
            return Some(HeartbeatAction::SendProbe);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ_IDLE: Duration = Duration::from_secs(30);
    const WRITE_IDLE: Duration = Duration::from_secs(10);

    fn monitor(now: Instant) -> HeartbeatMonitor {
        HeartbeatMonitor::with_limits(now, READ_IDLE, WRITE_IDLE, 3)
    }

    #[test]
    fn quiet_connection_sends_exactly_one_probe_per_interval() {
        let t0 = Instant::now();
        let mut hb = monitor(t0);
        assert_eq!(hb.poll(t0), None);

        let t1 = t0 + WRITE_IDLE;
        assert_eq!(hb.poll(t1), Some(HeartbeatAction::SendProbe));
        hb.on_write(t1);
        assert_eq!(hb.poll(t1), None, "probe resets the write deadline");
    }

    #[test]
    fn replies_keep_the_counter_at_zero() {
        let t0 = Instant::now();
        let mut hb = monitor(t0);
        for round in 1..10u64 {
            let t = t0 + WRITE_IDLE * round as u32;
            assert_eq!(hb.poll(t), Some(HeartbeatAction::SendProbe));
            hb.on_write(t);
            hb.on_heartbeat_reply(t + Duration::from_millis(50));
        }
        assert_eq!(hb.missed(), 0);
    }

    #[test]
    fn unanswered_probes_close_past_the_threshold() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::with_limits(t0, Duration::from_secs(3600), WRITE_IDLE, 3);
        let mut now = t0;
        for _ in 0..3 {
            now += WRITE_IDLE;
            assert_eq!(hb.poll(now), Some(HeartbeatAction::SendProbe));
            hb.on_write(now);
        }
        now += WRITE_IDLE;
        assert_eq!(
            hb.poll(now),
            Some(HeartbeatAction::Close(CloseCause::MissedHeartbeats))
        );
    }

    #[test]
    fn read_idle_closes_immediately_and_wins_over_probing() {
        let t0 = Instant::now();
        let mut hb = monitor(t0);
        let t = t0 + READ_IDLE;
        assert_eq!(hb.poll(t), Some(HeartbeatAction::Close(CloseCause::ReadIdle)));
    }

    #[test]
    fn inbound_traffic_defers_the_read_deadline() {
        let t0 = Instant::now();
        let mut hb = monitor(t0);
        hb.on_read(t0 + Duration::from_secs(25));
        assert_eq!(hb.poll(t0 + READ_IDLE), Some(HeartbeatAction::SendProbe));
    }

    #[test]
    fn next_deadline_is_the_earlier_timer() {
        let t0 = Instant::now();
        let hb = monitor(t0);
        assert_eq!(hb.next_deadline(), t0 + WRITE_IDLE);
    }
}
