use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use relay_core::ConfigError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const MAX_FPS_ENV: &str = "RELAY_MAX_FPS";
const FPS_FACTOR_ENV: &str = "RELAY_FPS_FACTOR";

/// Paint cadence of a 60 Hz display.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_nanos(16_666_667);

/// Delivery rate limits for a [`RenderThrottle`]. The most restrictive limit
/// wins.
#[derive(Clone, Debug, PartialEq)]
pub struct ThrottleConfig {
    /// Upper bound on deliveries per second of wall-clock time.
    pub max_fps: Option<f64>,
    /// Minimum number of host frames between deliveries.
    pub fps_factor: Option<f64>,
    /// Host paint interval `fps_factor` is measured in.
    pub frame_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_fps: None,
            fps_factor: None,
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }
}

impl ThrottleConfig {
    /// No limits: every `set` is delivered immediately.
    pub fn unthrottled() -> Self {
        Self::default()
    }

    /// Caps deliveries per second.
    pub fn max_fps(mut self, fps: f64) -> Self {
        self.max_fps = Some(fps);
        self
    }

    /// Requires `factor` host frames between deliveries.
    pub fn fps_factor(mut self, factor: f64) -> Self {
        self.fps_factor = Some(factor);
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Reads `RELAY_MAX_FPS` and `RELAY_FPS_FACTOR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            max_fps: positive(&lookup, MAX_FPS_ENV)?,
            fps_factor: positive(&lookup, FPS_FACTOR_ENV)?,
            ..Self::default()
        })
    }

    /// Minimum time between two throttled deliveries.
    pub fn interval(&self) -> Duration {
        let by_fps = self
            .max_fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .map_or(Duration::ZERO, |fps| Duration::from_secs_f64(1.0 / fps));
        let by_frames = self
            .fps_factor
            .filter(|factor| factor.is_finite() && *factor > 0.0)
            .map_or(Duration::ZERO, |factor| self.frame_interval.mul_f64(factor));
        by_fps.max(by_frames)
    }
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<f64>, ConfigError> {
    let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, format!("{e}")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::invalid(key, "must be a positive number"));
    }
    Ok(Some(value))
}

/// Identifies a subscription on one [`RenderThrottle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct State<T> {
    current: T,
    latest: T,
    last_delivery: Option<Instant>,
    scheduled: Option<JoinHandle<()>>,
    /// Bumped on every delivery; a scheduled task for an older generation
    /// has been superseded.
    generation: u64,
    /// A value is waiting but no task could be scheduled for it.
    held: bool,
    subscribers: Vec<(SubscriptionId, Subscriber<T>)>,
    next_subscription: u64,
    disposed: bool,
}

struct Shared<T> {
    interval: Duration,
    state: Mutex<State<T>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rate limiter between a high-frequency value source and its renderers.
///
/// Values passed to [`set`](Self::set) reach subscribers no sooner than the
/// configured interval after the previous delivery; intermediate values are
/// coalesced into the most recent one. Delayed deliveries run on the tokio
/// runtime the throttle is used from; without one, a value that arrives early
/// is held until a later `set` finds the interval elapsed or `set_instant`
/// is called.
pub struct RenderThrottle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> RenderThrottle<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Throttle starting with `initial` as both current and latest value.
    pub fn new(initial: T, config: &ThrottleConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                interval: config.interval(),
                state: Mutex::new(State {
                    current: initial.clone(),
                    latest: initial,
                    last_delivery: None,
                    scheduled: None,
                    generation: 0,
                    held: false,
                    subscribers: Vec::new(),
                    next_subscription: 0,
                    disposed: false,
                }),
            }),
        }
    }

    /// Minimum spacing between deliveries.
    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Last delivered value.
    pub fn current(&self) -> T {
        lock(&self.shared.state).current.clone()
    }

    /// Last requested value, delivered or not.
    pub fn latest(&self) -> T {
        lock(&self.shared.state).latest.clone()
    }

    /// Requests delivery of `value`, immediately if the interval since the
    /// last delivery elapsed, otherwise at the end of it.
    pub fn set(&self, value: T) {
        let mut state = lock(&self.shared.state);
        if state.disposed {
            return;
        }
        state.latest = value;
        if state.scheduled.is_some() {
            return;
        }
        let now = Instant::now();
        let due = state
            .last_delivery
            .map(|last| last + self.shared.interval)
            .filter(|due| *due > now);
        match (due, tokio::runtime::Handle::try_current()) {
            (Some(due), Ok(runtime)) => {
                let shared = Arc::downgrade(&self.shared);
                let generation = state.generation;
                state.scheduled = Some(runtime.spawn(deliver_at(shared, due, generation)));
            }
            (Some(_), Err(_)) => {
                debug!("no runtime for delayed render delivery, holding value");
                state.held = true;
            }
            (None, _) => deliver(state, now),
        }
    }

    /// Computes the next value from [`latest`](Self::latest) and sets it.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&lock(&self.shared.state).latest);
        self.set(next);
    }

    /// Cancels any scheduled delivery and delivers `value` now.
    pub fn set_instant(&self, value: T) {
        let mut state = lock(&self.shared.state);
        if state.disposed {
            return;
        }
        if let Some(task) = state.scheduled.take() {
            task.abort();
        }
        state.latest = value;
        deliver(state, Instant::now());
    }

    /// Registers `callback` for every later delivery. Callbacks run outside
    /// the throttle's lock.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let mut state = lock(&self.shared.state);
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        if !state.disposed {
            state.subscribers.push((id, Arc::new(callback)));
        }
        id
    }

    /// Removes a callback. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = lock(&self.shared.state);
        let before = state.subscribers.len();
        state.subscribers.retain(|(sub, _)| *sub != id);
        state.subscribers.len() != before
    }

    /// Whether a requested value has not been delivered yet.
    pub fn is_pending(&self) -> bool {
        let state = lock(&self.shared.state);
        state.scheduled.is_some() || state.held
    }

    /// Cancels the pending delivery and drops all subscribers. Later sets are
    /// ignored.
    pub fn dispose(&self) {
        let mut state = lock(&self.shared.state);
        state.disposed = true;
        state.subscribers.clear();
        if let Some(task) = state.scheduled.take() {
            task.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.shared.state).disposed
    }
}

impl<T> Drop for RenderThrottle<T> {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        if let Some(task) = state.scheduled.take() {
            task.abort();
        }
    }
}

async fn deliver_at<T: Clone>(shared: Weak<Shared<T>>, due: Instant, generation: u64) {
    tokio::time::sleep_until(due).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = lock(&shared.state);
    if state.generation != generation {
        return;
    }
    state.scheduled = None;
    if state.disposed {
        return;
    }
    deliver(state, Instant::now());
}

/// Publishes `latest` and notifies subscribers after releasing the lock.
fn deliver<T: Clone>(mut state: MutexGuard<'_, State<T>>, now: Instant) {
    state.current = state.latest.clone();
    state.last_delivery = Some(now);
    state.generation += 1;
    state.held = false;
    let value = state.current.clone();
    let subscribers: Vec<Subscriber<T>> = state
        .subscribers
        .iter()
        .map(|(_, callback)| callback.clone())
        .collect();
    drop(state);
    for callback in subscribers {
        callback(&value);
    }
}
