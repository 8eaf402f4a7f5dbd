use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::progress::ProgressIndicator;
use super::withdrawal::{Withdrawal, WithdrawalStatus};

/// How long a drawer survives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiration {
    /// Evicted this long after the reservation, whatever happens meanwhile.
    Fixed(Duration),
    /// Kept until the host runs short on memory and the content has been read.
    UntilMemoryPressure,
    /// Kept indefinitely until withdrawn; each withdrawal restarts a window of
    /// this length, after which the drawer is evicted.
    SlidingAfterWithdrawal(Duration),
}

impl Expiration {
    /// Positive: fixed TTL. Zero: until memory pressure. Negative: sliding
    /// window of the magnitude, started by withdrawal.
    pub fn from_millis(ttl: i64) -> Self {
        match ttl {
            0 => Self::UntilMemoryPressure,
            ttl if ttl > 0 => Self::Fixed(Duration::from_millis(ttl.unsigned_abs())),
            ttl => Self::SlidingAfterWithdrawal(Duration::from_millis(ttl.unsigned_abs())),
        }
    }

    pub fn as_millis(&self) -> i64 {
        match *self {
            Self::Fixed(ttl) => millis(ttl),
            Self::UntilMemoryPressure => 0,
            Self::SlidingAfterWithdrawal(window) => -millis(window),
        }
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(ttl) => write!(f, "fixed {}ms", ttl.as_millis()),
            Self::UntilMemoryPressure => f.write_str("until memory pressure"),
            Self::SlidingAfterWithdrawal(window) => {
                write!(f, "sliding {}ms after withdrawal", window.as_millis())
            }
        }
    }
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// One claim's lifecycle. Timestamps are wall-clock epoch millis; zero means
/// "has not happened".
pub(crate) struct Drawer<T> {
    expiration: Expiration,
    opened_at: i64,
    deposited_at: i64,
    withdrawn_at: i64,
    aged_at: i64,
    content: Option<Arc<T>>,
    progress: Option<Arc<dyn ProgressIndicator>>,
}

impl<T> Drawer<T> {
    pub(crate) fn new(
        expiration: Expiration,
        progress: Option<Arc<dyn ProgressIndicator>>,
        now: i64,
    ) -> Self {
        Self {
            expiration,
            opened_at: now,
            deposited_at: 0,
            withdrawn_at: 0,
            aged_at: 0,
            content: None,
            progress,
        }
    }

    pub(crate) fn opened_at(&self) -> i64 {
        self.opened_at
    }

    pub(crate) fn progress(&self) -> Option<&Arc<dyn ProgressIndicator>> {
        self.progress.as_ref()
    }

    pub(crate) fn has_deposit(&self) -> bool {
        self.content.is_some()
    }

    /// The current deposit has been withdrawn at least once.
    pub(crate) fn has_been_read(&self) -> bool {
        self.has_deposit() && self.withdrawn_at > 0
    }

    pub(crate) fn expires_at(&self) -> i64 {
        match self.expiration {
            Expiration::Fixed(ttl) => self.opened_at.saturating_add(millis(ttl)),
            Expiration::SlidingAfterWithdrawal(_) => self.aged_at,
            Expiration::UntilMemoryPressure => 0,
        }
    }

    pub(crate) fn is_expired(&self, now: i64) -> bool {
        match self.expiration {
            Expiration::Fixed(_) => now >= self.expires_at(),
            _ => false,
        }
    }

    pub(crate) fn is_aged(&self, now: i64) -> bool {
        self.aged_at > 0 && now >= self.aged_at
    }

    pub(crate) fn should_incinerate(&self, now: i64, memory_pressure: bool) -> bool {
        self.is_expired(now) || self.is_aged(now) || (memory_pressure && self.has_been_read())
    }

    /// A new deposit replaces the old one and starts unread.
    pub(crate) fn deposit(&mut self, content: T, now: i64) {
        self.content = Some(Arc::new(content));
        self.deposited_at = now;
        self.withdrawn_at = 0;
        self.aged_at = 0;
    }

    /// Reads the content, marking it withdrawn and restarting a sliding window.
    pub(crate) fn take_contents(&mut self, now: i64) -> Option<Arc<T>> {
        let content = self.content.clone()?;
        self.withdrawn_at = now;
        if let Expiration::SlidingAfterWithdrawal(window) = self.expiration {
            self.aged_at = now.saturating_add(millis(window));
        }
        Some(content)
    }

    pub(crate) fn peek(&self) -> Option<Arc<T>> {
        self.content.clone()
    }

    pub(crate) fn snapshot(
        &self,
        claim: u64,
        content: Option<Arc<T>>,
        expires_at: i64,
    ) -> Withdrawal<T> {
        let status = if self.has_deposit() {
            WithdrawalStatus::Retrieved
        } else {
            WithdrawalStatus::NoDeposit
        };
        Withdrawal::new(
            claim,
            status,
            content,
            [self.opened_at, self.deposited_at, self.withdrawn_at, expires_at],
            self.progress.as_ref().and_then(|progress| progress.completion_ratio()),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Drawer, Expiration};

    #[test]
    fn legacy_millis_map_to_variants() {
        assert_eq!(
            Expiration::from_millis(500),
            Expiration::Fixed(Duration::from_millis(500))
        );
        assert_eq!(Expiration::from_millis(0), Expiration::UntilMemoryPressure);
        assert_eq!(
            Expiration::from_millis(-250),
            Expiration::SlidingAfterWithdrawal(Duration::from_millis(250))
        );
        assert_eq!(Expiration::from_millis(-250).as_millis(), -250);
    }

    #[test]
    fn fixed_ttl_expires_once_time_has_passed() {
        let drawer: Drawer<String> = Drawer::new(Expiration::from_millis(500), None, 1_000);
        assert!(!drawer.should_incinerate(1_499, false));
        assert!(drawer.should_incinerate(1_500, false));
    }

    #[test]
    fn sliding_window_starts_at_withdrawal_and_renews() {
        let mut drawer = Drawer::new(Expiration::from_millis(-500), None, 0);
        assert!(drawer.take_contents(10).is_none());
        assert!(!drawer.should_incinerate(10_000, false));

        drawer.deposit("v".to_owned(), 20);
        assert!(drawer.take_contents(100).is_some());
        assert!(drawer.take_contents(400).is_some());
        assert!(!drawer.should_incinerate(899, false));
        assert!(drawer.should_incinerate(900, false));
    }

    #[test]
    fn memory_pressure_spares_unread_content() {
        let mut drawer = Drawer::new(Expiration::UntilMemoryPressure, None, 0);
        drawer.deposit(7_u32, 5);
        assert!(!drawer.should_incinerate(i64::MAX, true));

        drawer.take_contents(6);
        assert!(!drawer.should_incinerate(i64::MAX, false));
        assert!(drawer.should_incinerate(7, true));

        drawer.deposit(8_u32, 9);
        assert!(!drawer.should_incinerate(10, true));
    }
}
