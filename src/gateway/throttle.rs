use crate::gateway::types::{GatewayError, ThrottleConfig};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// Bounds in-flight calls and paces call starts with an adaptive delay.
///
/// Knows nothing about credentials or payloads.
#[derive(Debug)]
pub struct ConcurrencyThrottle {
    config: ThrottleConfig,
    in_flight: Arc<Semaphore>,
    state: Arc<Mutex<ThrottleState>>,
}

#[derive(Debug)]
struct ThrottleState {
    /// Start times of calls inside the current adaptive window
    window: VecDeque<Instant>,
    current_delay: Duration,
    success_streak: u32,
    total_successes: u64,
    total_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// One reserved in-flight slot. Dropping it without [`ConcurrencyThrottle::release`]
/// frees the slot but leaves pacing untouched.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
    pub acquired_at: Instant,
    pub permit_id: Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleStatus {
    pub max_in_flight: usize,
    pub in_flight: usize,
    pub current_delay: Duration,
    pub success_streak: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl ConcurrencyThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        let state = ThrottleState {
            window: VecDeque::with_capacity(max_in_flight),
            current_delay: config
                .base_delay
                .clamp(config.min_delay, config.max_delay.max(config.min_delay)),
            success_streak: 0,
            total_successes: 0,
            total_failures: 0,
        };

        Self {
            config: ThrottleConfig {
                max_in_flight,
                ..config
            },
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.config.max_in_flight
    }

    /// Wait for an in-flight slot, then for room in the adaptive window.
    ///
    /// The state mutex is only held while checking the window, never across the
    /// wait, so `release` and `get_status` stay responsive.
    pub async fn acquire(&self) -> Result<ThrottlePermit, GatewayError> {
        let permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::ShuttingDown)?;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let delay = state.current_delay;
                while state
                    .window
                    .front()
                    .is_some_and(|start| now.duration_since(*start) >= delay)
                {
                    state.window.pop_front();
                }

                match state.window.front().copied() {
                    Some(oldest) if state.window.len() >= self.config.max_in_flight => {
                        (oldest + delay).saturating_duration_since(now)
                    }
                    _ => {
                        state.window.push_back(now);
                        return Ok(ThrottlePermit {
                            _permit: permit,
                            acquired_at: now,
                            permit_id: Uuid::new_v4(),
                        });
                    }
                }
            };

            trace!("Throttle window full, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Record the outcome of a call and free its slot
    pub async fn release(&self, permit: ThrottlePermit, outcome: Outcome) {
        let mut state = self.state.lock().await;
        match outcome {
            Outcome::Success => {
                state.total_successes += 1;
                state.success_streak += 1;
                if state.success_streak % self.config.successes_per_decrease.max(1) == 0 {
                    let reduced = state
                        .current_delay
                        .saturating_sub(self.config.decrease_step)
                        .max(self.config.min_delay);
                    if reduced != state.current_delay {
                        debug!("Adaptive delay lowered to {:?}", reduced);
                    }
                    state.current_delay = reduced;
                }
            }
            Outcome::Failure => {
                state.total_failures += 1;
                state.success_streak = 0;
                let raised = (state.current_delay + self.config.increase_step)
                    .min(self.config.max_delay);
                if raised != state.current_delay {
                    debug!("Adaptive delay raised to {:?}", raised);
                }
                state.current_delay = raised;
            }
        }
        drop(state);
        drop(permit);
    }

    /// Reject further acquisitions; waiting callers get `ShuttingDown`
    pub fn close(&self) {
        self.in_flight.close();
    }

    pub async fn current_delay(&self) -> Duration {
        self.state.lock().await.current_delay
    }

    pub async fn get_status(&self) -> ThrottleStatus {
        let state = self.state.lock().await;
        ThrottleStatus {
            max_in_flight: self.config.max_in_flight,
            in_flight: self
                .config
                .max_in_flight
                .saturating_sub(self.in_flight.available_permits()),
            current_delay: state.current_delay,
            success_streak: state.success_streak,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_five_successes_lower_delay_once() {
        let throttle = ConcurrencyThrottle::new(ThrottleConfig::default());
        assert_eq!(throttle.current_delay().await, Duration::from_millis(1000));

        let mut delays = Vec::new();
        for _ in 0..5 {
            let permit = throttle.acquire().await.unwrap();
            throttle.release(permit, Outcome::Success).await;
            delays.push(throttle.current_delay().await.as_millis());
        }

        assert_eq!(delays, vec![1000, 1000, 950, 950, 950]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_respects_floor_and_ceiling() {
        let throttle = ConcurrencyThrottle::new(ThrottleConfig::default());

        for _ in 0..60 {
            let permit = throttle.acquire().await.unwrap();
            throttle.release(permit, Outcome::Success).await;
        }
        assert_eq!(throttle.current_delay().await, Duration::from_millis(400));

        for _ in 0..20 {
            let permit = throttle.acquire().await.unwrap();
            throttle.release(permit, Outcome::Failure).await;
        }
        assert_eq!(throttle.current_delay().await, Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_resets_success_streak() {
        let throttle = ConcurrencyThrottle::new(ThrottleConfig::default());

        for outcome in [Outcome::Success, Outcome::Success, Outcome::Failure] {
            let permit = throttle.acquire().await.unwrap();
            throttle.release(permit, outcome).await;
        }
        assert_eq!(throttle.current_delay().await, Duration::from_millis(1250));

        // Two more successes are not enough for a decrease after the reset
        for _ in 0..2 {
            let permit = throttle.acquire().await.unwrap();
            throttle.release(permit, Outcome::Success).await;
        }
        assert_eq!(throttle.current_delay().await, Duration::from_millis(1250));
        assert_eq!(throttle.get_status().await.success_streak, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_in_flight() {
        let throttle = Arc::new(ConcurrencyThrottle::new(ThrottleConfig {
            max_in_flight: 3,
            ..Default::default()
        }));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let throttle = Arc::clone(&throttle);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let permit = throttle.acquire().await.unwrap();
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now_active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1500)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                throttle.release(permit, Outcome::Success).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(throttle.get_status().await.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_spaces_call_starts() {
        let throttle = ConcurrencyThrottle::new(ThrottleConfig {
            max_in_flight: 1,
            ..Default::default()
        });

        let first = throttle.acquire().await.unwrap();
        let first_at = first.acquired_at;
        throttle.release(first, Outcome::Failure).await;

        // Delay is now 1250ms; the next start waits for the window to clear
        let second = throttle.acquire().await.unwrap();
        assert!(second.acquired_at.duration_since(first_at) >= Duration::from_millis(1250));
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_not_blocked_by_waiting_acquire() {
        let throttle = Arc::new(ConcurrencyThrottle::new(ThrottleConfig {
            max_in_flight: 2,
            ..Default::default()
        }));

        let first = throttle.acquire().await.unwrap();
        let second = throttle.acquire().await.unwrap();
        throttle.release(first, Outcome::Success).await;

        // Gets the freed slot, then waits about a second for the window to clear
        let waiter = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move { throttle.acquire().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        let before = Instant::now();
        throttle.release(second, Outcome::Success).await;
        let status = throttle.get_status().await;
        assert!(before.elapsed() < Duration::from_millis(100));
        assert_eq!(status.total_successes, 2);

        let third = waiter.await.unwrap();
        assert!(third.acquired_at.duration_since(before) >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let throttle = ConcurrencyThrottle::new(ThrottleConfig::default());
        throttle.close();
        assert!(matches!(
            throttle.acquire().await,
            Err(GatewayError::ShuttingDown)
        ));
    }
}
