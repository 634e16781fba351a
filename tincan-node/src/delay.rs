//! Millisecond countdown timers
//!
//! All timing in the node is driven by the elapsed time passed to `step`; nothing reads a clock.

/// A countdown timer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Delay {
    /// Not counting
    #[default]
    Idle,
    /// Counting down, with the remaining time in ms. Expired at 0.
    Running(u32),
}

impl Delay {
    /// Start counting down from `ms`
    pub fn set(&mut self, ms: u32) {
        *self = Delay::Running(ms);
    }

    /// Stop the timer
    pub fn stop(&mut self) {
        *self = Delay::Idle;
    }

    /// Force the timer to the expired state
    pub fn expire(&mut self) {
        *self = Delay::Running(0);
    }

    /// Count down by `ms`, stopping at 0
    pub fn elapse(&mut self, ms: u32) {
        if let Delay::Running(remaining) = self {
            *remaining = remaining.saturating_sub(ms);
        }
    }

    /// Limit the remaining time to at most `ms`
    pub fn clamp(&mut self, ms: u32) {
        if let Delay::Running(remaining) = self {
            *remaining = (*remaining).min(ms);
        }
    }

    /// Returns true once a running timer reaches 0
    pub fn expired(&self) -> bool {
        matches!(self, Delay::Running(0))
    }

    /// Returns true if the timer is counting or expired
    pub fn is_running(&self) -> bool {
        matches!(self, Delay::Running(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countdown() {
        let mut delay = Delay::default();
        delay.elapse(10);
        assert!(!delay.expired());
        assert!(!delay.is_running());

        delay.set(25);
        delay.elapse(10);
        assert_eq!(Delay::Running(15), delay);
        delay.clamp(5);
        assert_eq!(Delay::Running(5), delay);
        delay.elapse(100);
        assert!(delay.expired());

        delay.stop();
        assert!(!delay.expired());
        delay.expire();
        assert!(delay.expired());
    }
}
