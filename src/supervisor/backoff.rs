use std::time::Duration;

/// Added to the restart delay after each exit that used little CPU.
pub const BACKOFF_STEP: Duration = Duration::from_secs(5);

/// A worker whose accumulated delay reaches this is not restarted again.
pub const GIVE_UP_AT: Duration = Duration::from_secs(30);

/// Exits with less system CPU time than this count as crashes on startup.
pub const FAST_EXIT_CPU_TIME: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { after: Duration },
    GiveUp,
}

/// Tunables for [`RestartBackoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub step: Duration,
    pub give_up_at: Duration,
    pub fast_exit_cpu_time: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            step: BACKOFF_STEP,
            give_up_at: GIVE_UP_AT,
            fast_exit_cpu_time: FAST_EXIT_CPU_TIME,
        }
    }
}

/// Restart delay of one supervised worker. Never resets on its own.
#[derive(Debug, Clone, Default)]
pub struct RestartBackoff {
    policy: RestartPolicy,
    delay: Duration,
}

impl RestartBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: RestartPolicy) -> Self {
        Self {
            policy,
            delay: Duration::ZERO,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn record_exit(&mut self, system_time: Duration) -> RestartDecision {
        if system_time < self.policy.fast_exit_cpu_time {
            self.delay += self.policy.step;
        }
        if self.delay >= self.policy.give_up_at {
            RestartDecision::GiveUp
        } else {
            RestartDecision::Restart { after: self.delay }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_exits_accumulate_then_give_up() {
        let mut backoff = RestartBackoff::new();
        let fast = Duration::from_millis(10);

        for i in 1..=5u32 {
            assert_eq!(
                backoff.record_exit(fast),
                RestartDecision::Restart {
                    after: BACKOFF_STEP * i
                }
            );
        }
        assert_eq!(backoff.delay(), Duration::from_secs(25));
        assert_eq!(backoff.record_exit(fast), RestartDecision::GiveUp);
        assert!(backoff.delay() >= GIVE_UP_AT);
    }

    #[test]
    fn test_custom_policy() {
        let mut backoff = RestartBackoff::with_policy(RestartPolicy {
            step: Duration::from_millis(100),
            give_up_at: Duration::from_millis(200),
            ..RestartPolicy::default()
        });
        assert_eq!(
            backoff.record_exit(Duration::ZERO),
            RestartDecision::Restart {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(backoff.record_exit(Duration::ZERO), RestartDecision::GiveUp);
    }

    #[test]
    fn test_busy_exit_keeps_delay() {
        let mut backoff = RestartBackoff::new();
        assert_eq!(
            backoff.record_exit(Duration::from_secs(3)),
            RestartDecision::Restart {
                after: Duration::ZERO
            }
        );

        backoff.record_exit(Duration::ZERO);
        assert_eq!(
            backoff.record_exit(Duration::from_secs(2)),
            RestartDecision::Restart {
                after: Duration::from_secs(5)
            }
        );
    }
}
