use super::FailureKey;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Where a counter currently stands for the failure it tracks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuppressionState {
    /// No recent failures for the tracked key.
    Normal,
    /// Failures are logged while their timestamps fill the window.
    Accumulating { window: VecDeque<Instant> },
    /// Duplicates are dropped; a summary is logged once `interval` has passed.
    Suppressed { since: Instant, occurrences: u64 },
}

/// What the owner of a counter should do with the event it just observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Emit,
    Suppress,
    Summary { occurrences: u64, elapsed: Duration },
    Ignore,
}

/// Tracks repeated failures of a single key and decides which of them get logged.
///
/// A counter is owned by exactly one worker task and is never shared. It does not read
/// the clock itself; callers pass the time of each event.
#[derive(Debug)]
pub struct SuppressionCounter {
    threshold: usize,
    interval: Duration,
    current_key: Option<FailureKey>,
    state: SuppressionState,
}

impl SuppressionCounter {
    pub fn new(threshold: u64, interval: Duration) -> Self {
        SuppressionCounter {
            threshold: usize::try_from(threshold).unwrap_or(usize::MAX).max(1),
            interval,
            current_key: None,
            state: SuppressionState::Normal,
        }
    }

    pub fn state(&self) -> &SuppressionState {
        &self.state
    }

    pub fn current_key(&self) -> Option<&FailureKey> {
        self.current_key.as_ref()
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self.state, SuppressionState::Suppressed { .. })
    }

    pub fn on_failure(&mut self, key: &FailureKey, now: Instant) -> Verdict {
        // A different fault always interrupts whatever was tracked before
        if self.current_key.as_ref() != Some(key) {
            self.current_key = Some(key.clone());
            self.state = SuppressionState::Accumulating {
                window: VecDeque::from([now]),
            };
            return Verdict::Emit;
        }

        match &mut self.state {
            SuppressionState::Suppressed { since, occurrences } => {
                let elapsed = now.saturating_duration_since(*since);
                if elapsed >= self.interval {
                    // The closing event is part of the summary and of the threshold
                    // check that decides whether the key stays suppressed
                    let occurrences = *occurrences + 1;
                    self.close_period(occurrences, elapsed, now)
                } else {
                    *occurrences += 1;
                    Verdict::Suppress
                }
            }
            SuppressionState::Normal => {
                self.state = SuppressionState::Accumulating {
                    window: VecDeque::new(),
                };
                self.record(now)
            }
            SuppressionState::Accumulating { .. } => self.record(now),
        }
    }

    /// Clears the state when it belongs to `source`. Returns whether anything was reset.
    pub fn on_success(&mut self, source: &str) -> bool {
        match &self.current_key {
            Some(key) if key.source == source => {
                self.state = SuppressionState::Normal;
                true
            }
            _ => false,
        }
    }

    /// Called when no event arrived for a whole interval.
    pub fn on_idle(&mut self, now: Instant) -> Verdict {
        match self.state {
            SuppressionState::Suppressed { since, occurrences } => {
                let elapsed = now.saturating_duration_since(since);
                self.close_period(occurrences, elapsed, now)
            }
            _ => Verdict::Ignore,
        }
    }

    fn record(&mut self, now: Instant) -> Verdict {
        let SuppressionState::Accumulating { window } = &mut self.state else {
            return Verdict::Emit;
        };

        window.push_back(now);
        if window.len() >= self.threshold {
            let oldest = window.front().copied().unwrap_or(now);
            if now.saturating_duration_since(oldest) <= self.interval {
                self.state = SuppressionState::Suppressed {
                    since: now,
                    occurrences: 1,
                };
                return Verdict::Suppress;
            }
            window.pop_front();
        }

        Verdict::Emit
    }

    // Ends a suppression period. A key that kept failing at least `threshold` times
    // stays suppressed for another period. `occurrences` includes the event that closed
    // the period, if any, so a key failing exactly `threshold - 1` times plus the
    // closing event stays suppressed.
    fn close_period(&mut self, occurrences: u64, elapsed: Duration, now: Instant) -> Verdict {
        if occurrences as usize >= self.threshold {
            self.state = SuppressionState::Suppressed {
                since: now,
                occurrences: 0,
            };
        } else {
            self.state = SuppressionState::Normal;
        }

        if occurrences == 0 {
            return Verdict::Ignore;
        }

        Verdict::Summary {
            occurrences,
            elapsed,
        }
    }
}
