//! Self-clocked AIMD pacing of asynchronous operations.
//!
//! The controller issues operations at a target rate `w` (invocations per
//! millisecond), raising the rate additively after every success and cutting
//! it multiplicatively after every failure, the same feedback scheme TCP uses
//! for congestion windows. Scheduling is self-clocked: the delay before the
//! next invocation is derived from how far the issued count has drifted from
//! the rate-implied target, so a burst of fast completions consumes the
//! accumulated slack before any throttling kicks in.
//!
//! Every decision is bounded by one absolute deadline. A call that cannot
//! start a single attempt before the deadline fails with
//! [`InvokeError::DeadlineExceeded`]; a call whose operation failed and whose
//! next retry slot falls past the deadline re-raises the original failure.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bon::Builder;
use metrics::{counter, histogram};
use snafu::Snafu;
use tokio::time::{Instant, sleep};

/// Configuration of one pacing campaign.
///
/// The rate unit throughout is invocations per millisecond; a campaign
/// targeting 50 deliveries per second runs with `initial_rate = 0.05`.
#[derive(Clone, Copy, Debug, Builder)]
pub struct PacingSettings {
    /// Additive rate increase applied after every successful invocation.
    pub(crate) increase_per_success: f64,

    /// Multiplicative factor in `(0, 1]` applied to the rate after every
    /// failed invocation.
    pub(crate) decrease_ratio: f64,

    /// Starting issue rate, invocations per millisecond. Must be positive.
    pub(crate) initial_rate: f64,

    /// Absolute point in time after which no attempt may start.
    pub(crate) deadline: Instant,
}

/// Terminal outcome of [`PacingController::invoke`].
#[derive(Debug, Snafu)]
pub enum InvokeError<E>
where
    E: std::error::Error + 'static,
{
    /// The deadline was already unreachable when the call was made; the
    /// operation was never attempted.
    #[snafu(display("deadline exceeded before an attempt could start"))]
    DeadlineExceeded,

    /// The operation failed and the deadline leaves no room for another
    /// attempt. The original failure is carried unwrapped.
    #[snafu(display("operation failed with no budget left to retry: {source}"))]
    Operation { source: E },
}

impl<E> InvokeError<E>
where
    E: std::error::Error + 'static,
{
    /// True when the controller gave up without making a single attempt.
    pub const fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// The underlying operation failure, if one was made.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::DeadlineExceeded => None,
            Self::Operation { source } => Some(source),
        }
    }
}

/// Mutable rate state shared by every in-flight call on one controller.
#[derive(Debug)]
struct RateState {
    /// Count of invocations issued so far. Only ever increases.
    issued: u64,
    /// Current issue rate, invocations per millisecond. Always positive.
    rate: f64,
}

/// Shared AIMD pacing controller.
///
/// Cloning is cheap and every clone schedules against the same rate state,
/// so a single controller paces an entire campaign no matter how many
/// concurrent callers invoke through it. State updates are serialized behind
/// a mutex that is never held across an await point; concurrent calls
/// interleave their decisions in lock-acquisition order.
#[derive(Clone, Debug)]
pub struct PacingController {
    state: Arc<Mutex<RateState>>,
    start: Instant,
    deadline: Instant,
    increase: f64,
    decrease_ratio: f64,
}

impl PacingController {
    /// Build a controller from `settings`, starting its clock now.
    pub fn new(settings: PacingSettings) -> Self {
        debug_assert!(settings.initial_rate > 0.0);
        debug_assert!(settings.decrease_ratio > 0.0 && settings.decrease_ratio <= 1.0);
        Self {
            state: Arc::new(Mutex::new(RateState {
                issued: 0,
                rate: settings.initial_rate,
            })),
            start: Instant::now(),
            deadline: settings.deadline,
            increase: settings.increase_per_success,
            decrease_ratio: settings.decrease_ratio,
        }
    }

    /// Current issue rate in invocations per millisecond.
    pub fn current_rate(&self) -> f64 {
        self.locked().rate
    }

    /// Invocations issued so far, across all callers of this controller.
    pub fn issued(&self) -> u64 {
        self.locked().issued
    }

    /// Invoke `operation` under pacing, retrying failures until the deadline
    /// is provably unreachable.
    ///
    /// The operation receives the issue rate in force at the moment it is
    /// called. On success the shared rate is raised additively and the result
    /// returned; on failure the rate is cut multiplicatively and the call
    /// retries after whatever delay the lowered rate now implies, unless that
    /// delay falls past the deadline, in which case the original failure is
    /// re-raised as [`InvokeError::Operation`].
    pub async fn invoke<T, E, F, Fut>(&self, mut operation: F) -> Result<T, InvokeError<E>>
    where
        F: FnMut(f64) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let deadline = self.deadline_ms();
        let (mut now, mut delay) = {
            let state = self.locked();
            let now = self.elapsed_ms();
            (now, Self::pacing_delay(&state, now))
        };

        while now + delay < deadline {
            {
                let mut state = self.locked();
                state.issued += 1;
            }
            if delay > 0.0 {
                sleep(Duration::from_secs_f64(delay / 1_000.0)).await;
            }
            // The rate may have moved while this call slept.
            let rate = self.locked().rate;
            match operation(rate).await {
                Ok(value) => {
                    let raised = {
                        let mut state = self.locked();
                        state.rate += self.increase;
                        state.rate
                    };
                    histogram!("pacing_issue_rate").record(raised);
                    return Ok(value);
                }
                Err(error) => {
                    let lowered = {
                        let mut state = self.locked();
                        state.rate *= self.decrease_ratio;
                        now = self.elapsed_ms();
                        delay = Self::pacing_delay(&state, now);
                        state.rate
                    };
                    histogram!("pacing_issue_rate").record(lowered);
                    if deadline <= now + delay {
                        counter!("pacing_exhausted_total").increment(1);
                        error!(message = "Giving up after error.", %error, rate = lowered);
                        return Err(InvokeError::Operation { source: error });
                    }
                    counter!("pacing_retries_total").increment(1);
                    warn!(message = "Retrying after error.", %error, rate = lowered, delay_ms = delay);
                }
            }
        }

        debug!(message = "Deadline unreachable; refusing to attempt.", delay_ms = delay);
        Err(InvokeError::DeadlineExceeded)
    }

    /// Milliseconds to wait until the next invocation is on schedule at the
    /// current rate. Negative when the controller is behind schedule.
    fn pacing_delay(state: &RateState, now_ms: f64) -> f64 {
        let target = now_ms * state.rate;
        let shortfall = state.issued as f64 - target;
        shortfall / state.rate
    }

    fn elapsed_ms(&self) -> f64 {
        (Instant::now() - self.start).as_secs_f64() * 1_000.0
    }

    fn deadline_ms(&self) -> f64 {
        self.deadline
            .saturating_duration_since(self.start)
            .as_secs_f64()
            * 1_000.0
    }

    fn locked(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().expect("pacing state poisoned")
    }
}
