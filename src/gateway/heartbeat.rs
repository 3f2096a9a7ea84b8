use rand::Rng;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// How long to wait for HELLO (and the handshake) after the socket opens.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a heartbeat now.
    Send,
    /// The previous heartbeat was never acknowledged.
    Zombie,
}

/// Heartbeat schedule for one socket.
///
/// The first beat fires after `interval * jitter` (jitter in `0..1`) so that
/// many clients reconnecting at once do not beat in lockstep; every later beat
/// fires on the interval. A tick while the previous beat is still un-ACKed
/// means the connection is a zombie.
pub struct Heartbeater {
    period: Duration,
    ticker: Interval,
    awaiting_ack: bool,
    sent: u64,
}

impl Heartbeater {
    pub fn start(period: Duration) -> Self {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Self::with_first_delay(period, period.mul_f64(jitter))
    }

    pub fn with_first_delay(period: Duration, first: Duration) -> Self {
        let mut ticker = tokio::time::interval_at(Instant::now() + first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            period,
            ticker,
            awaiting_ack: false,
            sent: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Wait for the next scheduled beat.
    pub async fn tick(&mut self) {
        self.ticker.tick().await;
    }

    /// Decide what a scheduled tick means and record the beat if one is sent.
    pub fn on_tick(&mut self) -> Beat {
        if self.awaiting_ack {
            return Beat::Zombie;
        }
        self.record_sent();
        Beat::Send
    }

    /// Record a beat sent outside the schedule (server-requested op 1).
    pub fn record_sent(&mut self) {
        self.awaiting_ack = true;
        self.sent += 1;
    }

    pub fn ack(&mut self) {
        self.awaiting_ack = false;
    }

    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_beat_then_zombie_without_ack() {
        let mut hb = Heartbeater::with_first_delay(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(hb.on_tick(), Beat::Send);
        assert!(hb.awaiting_ack());
        assert_eq!(hb.on_tick(), Beat::Zombie);
        assert_eq!(hb.sent(), 1);
    }

    #[tokio::test]
    async fn test_ack_clears_pending_beat() {
        let mut hb = Heartbeater::with_first_delay(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(hb.on_tick(), Beat::Send);
        hb.ack();
        assert_eq!(hb.on_tick(), Beat::Send);
        assert_eq!(hb.sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_interval() {
        let period = Duration::from_millis(41_250);
        let mut hb = Heartbeater::with_first_delay(period, Duration::from_millis(500));
        let start = Instant::now();
        hb.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        hb.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500) + period);
        hb.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500) + period * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_first_beat_within_period() {
        let period = Duration::from_millis(1_000);
        let mut hb = Heartbeater::start(period);
        let start = Instant::now();
        hb.tick().await;
        assert!(start.elapsed() <= period);
        assert_eq!(hb.period(), period);
    }
}
