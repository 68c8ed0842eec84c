//! Declarative reconnect backoff.
//!
//! A [`BackoffSchedule`] is an ordered list of `(delay, attempts)` steps. It
//! plugs into `backon` as a [`BackoffBuilder`]: the built iterator yields each
//! step's delay `attempts` times, then `None` once the retry budget is spent.
//! Streams drive every reconnect through one of these, so adapters never
//! carry their own retry loops.

use std::time::Duration;

use backon::BackoffBuilder;
use serde::Deserialize;

/// One escalation step: wait `delay_ms` before each of `attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackoffStep {
    pub delay_ms: u64,
    pub attempts: u32,
}

impl BackoffStep {
    pub fn new(delay: Duration, attempts: u32) -> Self {
        Self {
            delay_ms: delay.as_millis() as u64,
            attempts,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Ordered escalating retry schedule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct BackoffSchedule {
    steps: Vec<BackoffStep>,
}

impl Default for BackoffSchedule {
    /// Quick retries first, then progressively slower ones:
    /// - 3 × 0ms
    /// - 3 × 10ms
    /// - 2 × 100ms
    /// - 2 × 1s
    /// - 5 × 3s
    fn default() -> Self {
        Self::new(vec![
            BackoffStep::new(Duration::ZERO, 3),
            BackoffStep::new(Duration::from_millis(10), 3),
            BackoffStep::new(Duration::from_millis(100), 2),
            BackoffStep::new(Duration::from_secs(1), 2),
            BackoffStep::new(Duration::from_secs(3), 5),
        ])
    }
}

impl BackoffSchedule {
    pub fn new(steps: Vec<BackoffStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[BackoffStep] {
        &self.steps
    }

    /// Total number of attempts before the budget is exhausted.
    pub fn total_attempts(&self) -> u64 {
        self.steps.iter().map(|s| u64::from(s.attempts)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_attempts() == 0
    }
}

impl BackoffBuilder for BackoffSchedule {
    type Backoff = ScheduledBackoff;

    fn build(self) -> Self::Backoff {
        ScheduledBackoff {
            steps: self.steps.into_iter(),
            current: None,
        }
    }
}

/// Iterator produced by [`BackoffSchedule`].
#[derive(Debug)]
pub struct ScheduledBackoff {
    steps: std::vec::IntoIter<BackoffStep>,
    current: Option<(Duration, u32)>,
}

impl Iterator for ScheduledBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        loop {
            match self.current {
                Some((delay, remaining)) if remaining > 0 => {
                    self.current = Some((delay, remaining - 1));
                    return Some(delay);
                }
                _ => {
                    let step = self.steps.next()?;
                    self.current = Some((step.delay(), step.attempts));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_yields_each_step_attempts_times() {
        let schedule = BackoffSchedule::new(vec![
            BackoffStep::new(Duration::ZERO, 2),
            BackoffStep::new(Duration::from_millis(50), 1),
            BackoffStep::new(Duration::from_millis(200), 2),
        ]);

        let delays: Vec<_> = schedule.build().collect();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_millis(50),
                Duration::from_millis(200),
                Duration::from_millis(200),
            ]
        );
    }

    #[test]
    fn test_zero_attempt_steps_are_skipped() {
        let schedule = BackoffSchedule::new(vec![
            BackoffStep::new(Duration::from_millis(5), 0),
            BackoffStep::new(Duration::from_millis(7), 1),
        ]);
        assert_eq!(
            schedule.build().collect::<Vec<_>>(),
            vec![Duration::from_millis(7)]
        );
    }

    #[test]
    fn test_empty_schedule_is_exhausted_immediately() {
        let schedule = BackoffSchedule::new(vec![]);
        assert!(schedule.is_empty());
        assert_eq!(schedule.build().next(), None);
    }

    #[test]
    fn test_default_schedule_escalates() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.total_attempts(), 15);

        let delays: Vec<_> = schedule.build().collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_schedule_deserializes_from_list() {
        #[derive(Deserialize)]
        struct Wrapper {
            reconnect: BackoffSchedule,
        }

        let parsed: Wrapper = ::config::Config::builder()
            .add_source(::config::File::from_str(
                "reconnect:\n  - { delay_ms: 0, attempts: 3 }\n  - { delay_ms: 250, attempts: 1 }\n",
                ::config::FileFormat::Yaml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(
            parsed.reconnect.steps(),
            &[
                BackoffStep::new(Duration::ZERO, 3),
                BackoffStep::new(Duration::from_millis(250), 1),
            ]
        );
    }
}
