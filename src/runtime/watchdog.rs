//! The watchdog thread.
//!
//! A single background loop scans every registered context, interrupts the
//! ones whose invocation has exceeded the task budget, and sleeps until the
//! next context is due to expire. The sleep is capped at the budget itself,
//! so the worst-case wake latency stays bounded even with no active tasks,
//! and the condvar wakes it early on task start, budget change or shutdown.

use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use super::registry::Shared;

/// Smallest reliably measurable interval of the monotonic clock. A task whose
/// remaining budget is at or below this cannot be usefully re-slept on.
fn clock_resolution() -> Duration {
    let start = Instant::now();
    let period = start.elapsed();
    if period.is_zero() {
        Duration::from_nanos(1)
    } else {
        period
    }
}

pub(crate) fn run(shared: Arc<Shared>) {
    let resolution = clock_resolution();
    let mut state = shared.lock();

    loop {
        if state.shutdown {
            tracing::debug!("watchdog stopped");
            return;
        }

        let budget = state.max_task_duration;
        let now = Instant::now();
        let mut next_due = budget;

        for (key, slot) in state.slots.iter_mut() {
            let Some(started_at) = slot.started_at else {
                continue;
            };
            let elapsed = now.duration_since(started_at);
            match budget.checked_sub(elapsed) {
                Some(remaining) if remaining > resolution => {
                    next_due = next_due.min(remaining);
                }
                _ => {
                    tracing::warn!(
                        %key,
                        elapsed_ms = elapsed.as_millis() as u64,
                        budget_ms = budget.as_millis() as u64,
                        "task exceeded budget, interrupting"
                    );
                    slot.interrupt.trigger();
                    // Cleared so the slot is not interrupted twice; the
                    // running invocation clears its own stamp on exit too.
                    slot.started_at = None;
                }
            }
        }

        state = shared
            .wake
            .wait_timeout(state, next_due)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InterruptFlag;
    use crate::types::{Config, ContextKey};

    #[test]
    fn clock_resolution_is_nonzero() {
        assert!(!clock_resolution().is_zero());
    }

    #[test]
    fn overdue_task_is_interrupted_and_cleared() {
        let config = Config {
            max_task_duration: Duration::from_millis(20),
            ..Config::default()
        };
        let shared = Arc::new(Shared::new(&config));
        let key = ContextKey::new(1);
        let flag = InterruptFlag::new();

        shared.register(key, flag.clone()).unwrap();
        shared.begin_task(key, &flag).unwrap();

        let handle = {
            let shared = shared.clone();
            std::thread::spawn(move || run(shared))
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while !flag.is_set() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(flag.is_set(), "watchdog never fired");
        assert!(shared.lock().slots[&key].started_at.is_none());

        shared.request_shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn idle_registry_leaves_flags_untouched() {
        let shared = Arc::new(Shared::new(&Config {
            max_task_duration: Duration::from_millis(10),
            ..Config::default()
        }));
        let key = ContextKey::new(2);
        let flag = InterruptFlag::new();
        shared.register(key, flag.clone()).unwrap();

        let handle = {
            let shared = shared.clone();
            std::thread::spawn(move || run(shared))
        };

        // Several scan intervals with no task running.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!flag.is_set());

        shared.request_shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_is_prompt_even_with_long_budget() {
        let shared = Arc::new(Shared::new(&Config::default()));

        let handle = {
            let shared = shared.clone();
            std::thread::spawn(move || run(shared))
        };

        std::thread::sleep(Duration::from_millis(20));
        let before = Instant::now();
        shared.request_shutdown();
        handle.join().unwrap();
        // Default budget is 5s; the condvar wakeup must beat it by far.
        assert!(before.elapsed() < Duration::from_secs(1));
    }
}
