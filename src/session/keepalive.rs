use std::time::{Duration, Instant};

/// Text of the periodic liveness probe.
pub const PING: &str = "ping";
/// Enables radio-side keepalive supervision of this client.
pub const ENABLE: &str = "keepalive enable";

/// Ping scheduling and liveness deadline for one session.
///
/// The radio is considered alive while some ping reply arrived within
/// `timeout`; the clock starts when keepalive is armed.
#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Duration,
    timeout: Duration,
    last_sent: Option<Instant>,
    last_heard: Instant,
}

impl Keepalive {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_sent: None,
            last_heard: now,
        }
    }

    pub fn ping_due(&self, now: Instant) -> bool {
        self.last_sent
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.interval)
    }

    pub fn ping_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// A ping reply arrived, whatever its status code.
    pub fn answered(&mut self, now: Instant) {
        self.last_heard = now;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heard) >= self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepalive(start: Instant) -> Keepalive {
        Keepalive::new(Duration::from_secs(1), Duration::from_secs(4), start)
    }

    #[test]
    fn pings_on_interval() {
        let start = Instant::now();
        let mut ka = keepalive(start);
        assert!(ka.ping_due(start));
        ka.ping_sent(start);
        assert!(!ka.ping_due(start + Duration::from_millis(999)));
        assert!(ka.ping_due(start + Duration::from_secs(1)));
    }

    #[test]
    fn silence_expires_after_timeout() {
        let start = Instant::now();
        let mut ka = keepalive(start);
        assert!(!ka.expired(start + Duration::from_secs(3)));
        ka.answered(start + Duration::from_secs(3));
        assert!(!ka.expired(start + Duration::from_secs(6)));
        assert!(ka.expired(start + Duration::from_secs(7)));
    }
}
