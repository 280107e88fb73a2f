use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-channel rate limiter owned by an alert sink.
///
/// A channel is "ready" when nothing has been recorded for it within the cooldown. Callers
/// record only after a successful delivery, so a failed send can be retried immediately.
#[derive(Debug)]
pub struct CooldownTracker {
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl CooldownTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Time left before `channel` may send again, if any.
    pub fn remaining_at(&self, channel: &str, now: Instant) -> Option<Duration> {
        let last_sent = self.last_sent.lock().ok()?;
        let last = last_sent.get(channel)?;
        let elapsed = now.saturating_duration_since(*last);
        (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
    }

    pub fn is_ready_at(&self, channel: &str, now: Instant) -> bool {
        self.remaining_at(channel, now).is_none()
    }

    pub fn is_ready(&self, channel: &str) -> bool {
        self.is_ready_at(channel, Instant::now())
    }

    pub fn record_at(&self, channel: &str, now: Instant) {
        if let Ok(mut last_sent) = self.last_sent.lock() {
            last_sent.insert(channel.to_string(), now);
        }
    }

    pub fn record(&self, channel: &str) {
        self.record_at(channel, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_cool_down_independently() {
        let cooldown = CooldownTracker::new(Duration::from_secs(30));
        let t0 = Instant::now();

        assert!(cooldown.is_ready_at("message", t0));
        cooldown.record_at("message", t0);

        assert!(!cooldown.is_ready_at("message", t0 + Duration::from_secs(10)));
        assert_eq!(
            cooldown.remaining_at("message", t0 + Duration::from_secs(10)),
            Some(Duration::from_secs(20))
        );
        assert!(cooldown.is_ready_at("photo", t0 + Duration::from_secs(10)));
        assert!(cooldown.is_ready_at("message", t0 + Duration::from_secs(30)));
    }
}
