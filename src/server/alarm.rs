/// Edge-triggered anomaly check. It speaks up once when the severed or
/// malformed counts grow past what it last reported, then stays quiet until
/// they grow again.
#[derive(Debug, Default)]
pub struct AnomalyAlarm {
    reported_severed: u64,
    reported_malformed: u64,
}

impl AnomalyAlarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, severed: u64, malformed: u64) -> Option<String> {
        // Counters shrink only when statistics are reset.
        if severed < self.reported_severed || malformed < self.reported_malformed {
            self.reported_severed = self.reported_severed.min(severed);
            self.reported_malformed = self.reported_malformed.min(malformed);
        }

        if severed == self.reported_severed && malformed == self.reported_malformed {
            return None;
        }

        let message = format!(
            "connection anomalies since last report: {} severed (total {}), {} malformed (total {})",
            severed - self.reported_severed,
            severed,
            malformed - self.reported_malformed,
            malformed,
        );
        self.reported_severed = severed;
        self.reported_malformed = malformed;
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::AnomalyAlarm;

    #[test]
    fn quiet_while_nothing_went_wrong() {
        let mut alarm = AnomalyAlarm::new();
        assert!(alarm.check(0, 0).is_none());
        assert!(alarm.check(0, 0).is_none());
    }

    #[test]
    fn fires_once_per_increase() {
        let mut alarm = AnomalyAlarm::new();

        let first = alarm.check(2, 0).expect("first increase should fire");
        assert!(first.contains("2 severed"));
        assert!(alarm.check(2, 0).is_none());

        let second = alarm.check(2, 1).expect("malformed increase should fire");
        assert!(second.contains("1 malformed"));
        assert!(alarm.check(2, 1).is_none());
    }

    #[test]
    fn rebaselines_after_stats_reset() {
        let mut alarm = AnomalyAlarm::new();
        alarm.check(5, 5);

        assert!(alarm.check(0, 0).is_none());
        assert!(alarm.check(1, 0).is_some());
    }
}
