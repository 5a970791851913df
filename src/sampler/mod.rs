//! # Telemetry Sampler Module
//!
//! Fixed-rate recorder merging live telemetry and decoded log values into a
//! session of samples.
//!
//! This module handles:
//! - The Stopped/Armed/Collecting/Stopping lifecycle
//! - The self-pacing tick loop on one tokio task
//! - The working "current" and "recording" samples
//! - Tick notifications to observers
//! - Windowing over the recorded session

pub mod mode;
pub mod sample;
pub mod window;

use std::any::Any;
use std::ops::RangeInclusive;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::SamplerConfig;
use crate::model::{
    FigureCatalog, HealthMonitor, LiveModel, LogValueSource, NoDerivedFigures, NoHealthCheck,
    NoLogSource,
};

pub use mode::SamplerMode;
pub use sample::Sample;

use mode::AtomicMode;

/// Subtracted from every sleep to absorb wake-up latency
const SAFETY_MARGIN: Duration = Duration::from_millis(2);

/// A message is forwarded only if newer than the last one by more than this
const MESSAGE_EPSILON_MS: u64 = 10;

/// Tick events buffered per observer before it starts lagging
const TICK_CHANNEL_CAPACITY: usize = 64;

/// Slack left before the tick deadline, published on the current sample
pub const SLACK_CHANNEL: &str = "SAMPLER_SLACK_MS";

/// Time spent inside the last tick, published on the current sample
pub const COST_CHANNEL: &str = "SAMPLER_COST_MS";

/// Collaborators read by the sampler on every tick
pub struct SamplerParts {
    pub live: Arc<dyn LiveModel>,
    pub log: Arc<dyn LogValueSource>,
    pub catalog: Arc<dyn FigureCatalog>,
    pub health: Arc<dyn HealthMonitor>,
}

impl SamplerParts {
    /// Parts with no log source, no derived figures and no health check
    pub fn new(live: Arc<dyn LiveModel>) -> Self {
        Self {
            live,
            log: Arc::new(NoLogSource),
            catalog: Arc::new(NoDerivedFigures),
            health: Arc::new(NoHealthCheck),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn LogValueSource>) -> Self {
        self.log = log;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn FigureCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_health(mut self, health: Arc<dyn HealthMonitor>) -> Self {
        self.health = health;
        self
    }
}

/// Published after every sample appended to the session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickEvent {
    /// Wall-clock time of the tick
    pub at: DateTime<Utc>,
    /// Session index of the appended sample
    pub index: usize,
}

/// Status flags for presentation; read without synchronization
#[derive(Debug, Default)]
pub struct Indicators {
    recording: AtomicBool,
    log_loaded: AtomicBool,
}

impl Indicators {
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub fn is_log_loaded(&self) -> bool {
        self.log_loaded.load(Ordering::Relaxed)
    }

    /// Mark that a complete log has been ingested for this session
    pub fn set_log_loaded(&self, loaded: bool) {
        self.log_loaded.store(loaded, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct WorkingSamples {
    /// Live-sourced
    current: Sample,
    /// Log-sourced
    recording: Sample,
}

/// Loop-local state, owned by the worker task
#[derive(Debug)]
struct WorkerState {
    old_mode: SamplerMode,
    /// Session generation the start actions last ran for
    generation: u64,
    session_start: Instant,
    last_message_tms: Option<u64>,
    slack_ms: f64,
    cost_ms: f64,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            old_mode: SamplerMode::Stopped,
            generation: 0,
            session_start: Instant::now(),
            last_message_tms: None,
            slack_ms: 0.0,
            cost_ms: 0.0,
        }
    }

    fn message_is_new(&mut self, tms: u64) -> bool {
        let is_new = match self.last_message_tms {
            Some(last) => tms > last + MESSAGE_EPSILON_MS,
            None => true,
        };
        if is_new {
            self.last_message_tms = Some(tms);
        }
        is_new
    }

    fn record_timing(&mut self, interval: Duration, spent: Duration) {
        self.cost_ms = spent.as_secs_f64() * 1000.0;
        self.slack_ms = interval.as_secs_f64() * 1000.0 - self.cost_ms;
    }
}

enum Step {
    Ticked,
    LinkDown,
}

struct Shared {
    mode: AtomicMode,
    /// Bumped whenever the session is replaced; written under the session lock
    generation: AtomicU64,
    interval_us: AtomicU64,
    total_window_s: AtomicU32,
    link_backoff: Duration,
    stop_settle: Duration,
    working: Mutex<WorkingSamples>,
    session: RwLock<Vec<Sample>>,
    indicators: Indicators,
    parts: SamplerParts,
    ticks: broadcast::Sender<TickEvent>,
}

impl Shared {
    fn working(&self) -> MutexGuard<'_, WorkingSamples> {
        self.working.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> RwLockReadGuard<'_, Vec<Sample>> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_mut(&self) -> RwLockWriteGuard<'_, Vec<Sample>> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_session(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us.load(Ordering::Relaxed))
    }

    fn step(&self, state: &mut WorkerState) -> Step {
        if !self.parts.live.is_connected() {
            if self.mode.load().is_active() {
                warn!("Telemetry link down, pausing collection");
            }
            self.mode.store(SamplerMode::Stopped);
            self.apply_transition(state, SamplerMode::Stopped);
            return Step::LinkDown;
        }

        self.tick(state);
        Step::Ticked
    }

    fn tick(&self, state: &mut WorkerState) {
        let snapshot = self.parts.live.snapshot();
        self.parts.health.check(&snapshot);

        let mode = self.mode.load();
        self.apply_transition(state, mode);

        let log_values = if self.parts.log.is_logging() {
            Some(self.parts.log.values())
        } else {
            None
        };
        let message = snapshot
            .message
            .as_ref()
            .filter(|m| state.message_is_new(m.tms))
            .cloned();
        let catalog = self.parts.catalog.as_ref();

        let authoritative = {
            let mut working = self.working();
            let WorkingSamples { current, recording } = &mut *working;

            current.set_raw(snapshot.raw_values());
            current.channels.insert(SLACK_CHANNEL.to_string(), state.slack_ms);
            current.channels.insert(COST_CHANNEL.to_string(), state.cost_ms);

            let logging = log_values.is_some();
            if let Some(values) = log_values {
                recording.set_raw(values);
                recording.compute_derived(catalog);
            }

            current.message = message.clone();
            recording.message = message;
            if let Some(spatial) = snapshot.spatial {
                current.spatial = Some(spatial);
                recording.spatial = Some(spatial);
            }
            current.compute_derived(catalog);

            if !mode.is_active() {
                None
            } else if logging {
                Some(recording.clone())
            } else {
                Some(current.clone())
            }
        };

        if let Some(mut sample) = authoritative {
            sample.stamp(state.session_start.elapsed().as_micros() as u64);
            let index = {
                let mut session = self.session_mut();
                if self.generation.load(Ordering::Acquire) == state.generation {
                    session.push(sample);
                    Some(session.len() - 1)
                } else {
                    debug!("Session replaced mid-tick, dropping sample");
                    None
                }
            };
            if let Some(index) = index {
                // No receivers is not an error
                let _ = self.ticks.send(TickEvent { at: Utc::now(), index });
            }
        }
    }

    fn apply_transition(&self, state: &mut WorkerState, mode: SamplerMode) {
        let was_active = state.old_mode.is_active();
        let generation = self.generation.load(Ordering::Acquire);
        let replaced = generation != state.generation;
        state.generation = generation;

        if mode.is_active() && (!was_active || replaced) {
            self.indicators.log_loaded.store(false, Ordering::Relaxed);
            self.indicators.recording.store(true, Ordering::Relaxed);
            self.parts.log.set_logging(true);
            state.session_start = Instant::now();
            info!("Recording started ({})", mode);
        } else if !mode.is_active() && was_active {
            self.parts.log.set_logging(false);
            self.indicators.recording.store(false, Ordering::Relaxed);
            info!("Recording stopped with {} samples", self.session().len());
        }
        state.old_mode = mode;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown fault")
}

async fn run_worker(shared: Arc<Shared>) {
    info!("Sampler worker running at {:?} per tick", shared.interval());
    let mut state = WorkerState::new();

    loop {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.step(&mut state)));
        let spent = started.elapsed();
        let interval = shared.interval();

        let pause = match outcome {
            Ok(Step::Ticked) => {
                state.record_timing(interval, spent);
                interval.saturating_sub(spent).saturating_sub(SAFETY_MARGIN)
            }
            Ok(Step::LinkDown) => shared.link_backoff,
            Err(payload) => {
                error!("Sampler tick failed: {}", panic_message(&*payload));
                interval.saturating_sub(spent)
            }
        };

        sleep(pause).await;
    }
}

/// Fixed-rate telemetry sampler
///
/// Owns the session and the working samples. One worker task, started by
/// [`spawn`](Self::spawn), drives the tick loop; every other method may be
/// called concurrently from any thread.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use telemetry_recorder::config::SamplerConfig;
/// use telemetry_recorder::model::SharedLiveModel;
/// use telemetry_recorder::sampler::{SamplerParts, TelemetrySampler};
///
/// # async fn run() {
/// let live = Arc::new(SharedLiveModel::new());
/// let sampler = TelemetrySampler::new(&SamplerConfig::default(), SamplerParts::new(live));
/// sampler.spawn();
/// sampler.start();
/// // ...
/// sampler.stop().await;
/// # }
/// ```
pub struct TelemetrySampler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TelemetrySampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySampler")
            .field("mode", &self.mode())
            .field("interval_us", &self.interval_us())
            .field("session_len", &self.session_len())
            .finish_non_exhaustive()
    }
}

impl TelemetrySampler {
    pub fn new(config: &SamplerConfig, parts: SamplerParts) -> Self {
        let (ticks, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let shared = Shared {
            mode: AtomicMode::new(SamplerMode::Stopped),
            generation: AtomicU64::new(0),
            interval_us: AtomicU64::new(config.interval_us),
            total_window_s: AtomicU32::new(config.total_window_s),
            link_backoff: Duration::from_millis(config.link_backoff_ms),
            stop_settle: Duration::from_millis(config.stop_settle_ms),
            working: Mutex::new(WorkingSamples::default()),
            session: RwLock::new(Vec::new()),
            indicators: Indicators::default(),
            parts,
            ticks,
        };

        Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the tick loop on the current tokio runtime
    ///
    /// Returns false if the loop is already running.
    pub fn spawn(&self) -> bool {
        let mut worker = self.worker();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        *worker = Some(tokio::spawn(run_worker(Arc::clone(&self.shared))));
        true
    }

    /// Abort the tick loop
    pub fn shutdown(&self) {
        if let Some(handle) = self.worker().take() {
            handle.abort();
            info!("Sampler worker shut down");
        }
    }

    pub fn mode(&self) -> SamplerMode {
        self.shared.mode.load()
    }

    /// Whether ticks currently append to the session
    pub fn is_collecting(&self) -> bool {
        self.mode().is_active()
    }

    pub fn indicators(&self) -> &Indicators {
        &self.shared.indicators
    }

    /// Enter pre-collect from `Stopped`, clearing the session
    ///
    /// Returns false in any other mode.
    pub fn arm(&self) -> bool {
        if self.shared.mode.load() != SamplerMode::Stopped {
            return false;
        }
        let mut session = self.shared.session_mut();
        if !self.shared.mode.transition(SamplerMode::Stopped, SamplerMode::Armed) {
            return false;
        }
        session.clear();
        self.shared.new_session();
        info!("Sampler armed");
        true
    }

    /// Begin collecting
    ///
    /// From `Armed` the pre-collected samples are kept. From `Stopped` the
    /// session is cleared first. Returns false in any other mode.
    pub fn start(&self) -> bool {
        match self.shared.mode.load() {
            SamplerMode::Armed => {
                let started = self.shared.mode.transition(SamplerMode::Armed, SamplerMode::Collecting);
                if started {
                    info!("Collecting, keeping {} pre-collected samples", self.session_len());
                }
                started
            }
            SamplerMode::Stopped => {
                let mut session = self.shared.session_mut();
                if !self.shared.mode.transition(SamplerMode::Stopped, SamplerMode::Collecting) {
                    return false;
                }
                session.clear();
                self.shared.new_session();
                info!("Collecting into a new session");
                true
            }
            SamplerMode::Collecting | SamplerMode::Stopping => false,
        }
    }

    /// Stop collecting and wait for the in-flight tick to settle
    pub async fn stop(&self) {
        self.shared.mode.store(SamplerMode::Stopped);
        debug!("Stop requested, settling for {:?}", self.shared.stop_settle);
        sleep(self.shared.stop_settle).await;
    }

    /// Keep collecting for `delay`, then stop
    ///
    /// Returns false if the sampler is not active. The deferred stop is
    /// dropped if the mode left `Stopping` in the meantime.
    pub fn stop_after(&self, delay: Duration) -> bool {
        let mode = self.shared.mode.load();
        if !mode.is_active() || !self.shared.mode.transition(mode, SamplerMode::Stopping) {
            return false;
        }

        info!("Stopping in {:?}", delay);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            sleep(delay).await;
            if shared.mode.transition(SamplerMode::Stopping, SamplerMode::Stopped) {
                info!("Deferred stop reached");
            }
        });
        true
    }

    pub fn interval_us(&self) -> u64 {
        self.shared.interval_us.load(Ordering::Relaxed)
    }

    /// Change the tick period; takes effect on the next tick
    pub fn set_interval_us(&self, interval_us: u64) {
        self.shared.interval_us.store(interval_us, Ordering::Relaxed);
    }

    pub fn total_window_s(&self) -> u32 {
        self.shared.total_window_s.load(Ordering::Relaxed)
    }

    pub fn set_total_window_s(&self, total_window_s: u32) {
        self.shared.total_window_s.store(total_window_s, Ordering::Relaxed);
    }

    /// Copy of the latest live-sourced sample
    pub fn current(&self) -> Sample {
        self.shared.working().current.clone()
    }

    /// Read access to the session
    pub fn session(&self) -> RwLockReadGuard<'_, Vec<Sample>> {
        self.shared.session()
    }

    pub fn session_len(&self) -> usize {
        self.shared.session().len()
    }

    pub fn sample_at(&self, index: usize) -> Option<Sample> {
        self.shared.session().get(index).cloned()
    }

    /// Replace the session with previously recorded samples
    ///
    /// Stops collection and recomputes derived figures for every sample.
    pub fn load_session(&self, samples: Vec<Sample>) {
        let catalog = self.shared.parts.catalog.as_ref();
        let samples: Vec<Sample> = samples
            .into_iter()
            .map(|mut sample| {
                sample.compute_derived(catalog);
                sample
            })
            .collect();

        info!("Loaded session with {} samples", samples.len());
        let mut session = self.shared.session_mut();
        self.shared.mode.store(SamplerMode::Stopped);
        self.shared.new_session();
        *session = samples;
    }

    /// Stop collecting and drop the session and the working samples
    pub fn clear_session(&self) {
        {
            let mut session = self.shared.session_mut();
            self.shared.mode.store(SamplerMode::Stopped);
            self.shared.new_session();
            session.clear();
        }
        *self.shared.working() = WorkingSamples::default();
        info!("Session cleared");
    }

    /// Elapsed time of the last recorded sample
    pub fn total_recording_ms(&self) -> u64 {
        self.shared.session().last().map_or(0, |s| s.tms_us / 1000)
    }

    /// Samples covering the analysis window at the current interval
    pub fn window_samples(&self) -> usize {
        window::window_samples(self.total_window_s(), self.interval_us() / 1000)
    }

    pub fn window_first(&self, factor: f64) -> usize {
        window::first_index(self.session_len(), self.window_samples(), factor)
    }

    pub fn window_last(&self, factor: f64) -> usize {
        window::last_index(self.session_len(), self.window_samples(), factor)
    }

    pub fn window_range(&self, factor: f64) -> Option<RangeInclusive<usize>> {
        window::window_range(self.session_len(), self.window_samples(), factor)
    }

    /// Sample at the end of the window when stopped, else the current one
    pub fn last_in_window(&self, factor: f64) -> Sample {
        if self.mode() == SamplerMode::Stopped {
            let session = self.shared.session();
            if !session.is_empty() {
                let last = window::last_index(session.len(), self.window_samples(), factor);
                return session[last].clone();
            }
        }
        self.current()
    }

    /// Receiver of every tick event published from now on
    pub fn tick_events(&self) -> broadcast::Receiver<TickEvent> {
        self.shared.ticks.subscribe()
    }

    /// Call `callback` with the wall-clock time of every completed tick
    ///
    /// The callback runs on its own task; a slow observer lags and skips
    /// events instead of delaying the tick loop.
    pub fn subscribe<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(DateTime<Utc>) + Send + 'static,
    {
        let mut events = self.tick_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => callback(event.at),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Tick observer lagging, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for TelemetrySampler {
    fn drop(&mut self) {
        if let Some(handle) = self.worker().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channels, LiveSnapshot, MockLiveModel, SharedLiveModel, StatusMessage};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> SamplerConfig {
        SamplerConfig {
            interval_us: 5_000,
            total_window_s: 30,
            link_backoff_ms: 10,
            stop_settle_ms: 20,
        }
    }

    fn connected_model() -> Arc<SharedLiveModel> {
        let live = Arc::new(SharedLiveModel::new());
        live.set_connected(true);
        live
    }

    fn stored_samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let mut sample = Sample::default();
                sample.stamp(i as u64 * 50_000);
                sample.channels.insert("index".to_string(), i as f64);
                sample
            })
            .collect()
    }

    #[derive(Default)]
    struct FakeLog {
        logging: AtomicBool,
    }

    impl LogValueSource for FakeLog {
        fn is_logging(&self) -> bool {
            self.logging.load(Ordering::SeqCst)
        }

        fn set_logging(&self, enabled: bool) {
            self.logging.store(enabled, Ordering::SeqCst);
        }

        fn values(&self) -> Channels {
            let mut values = Channels::new();
            values.insert("vehicle_local_position_0.z".to_string(), -12.0);
            values
        }
    }

    #[derive(Default)]
    struct FlakyHealth {
        calls: AtomicUsize,
    }

    impl HealthMonitor for FlakyHealth {
        fn check(&self, _snapshot: &LiveSnapshot) {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("health sink unavailable");
            }
        }
    }

    #[test]
    fn test_start_from_stopped_clears_session() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        sampler.load_session(stored_samples(5));
        assert_eq!(sampler.session_len(), 5);

        assert!(sampler.start());
        assert_eq!(sampler.mode(), SamplerMode::Collecting);
        assert_eq!(sampler.session_len(), 0);
    }

    #[test]
    fn test_start_is_noop_while_collecting() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        assert!(sampler.start());
        assert!(!sampler.start());
        assert!(!sampler.arm());
        assert_eq!(sampler.mode(), SamplerMode::Collecting);
    }

    #[tokio::test]
    async fn test_start_from_armed_keeps_session() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        assert!(sampler.arm());
        sampler.spawn();
        sleep(Duration::from_millis(60)).await;

        let pre_collected = sampler.session_len();
        assert!(pre_collected > 0, "armed sampler records pre-collect samples");

        assert!(sampler.start());
        assert_eq!(sampler.mode(), SamplerMode::Collecting);
        assert!(sampler.session_len() >= pre_collected);
        sampler.shutdown();
    }

    #[tokio::test]
    async fn test_stop_quiesces_session() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        sampler.spawn();
        sampler.start();
        sleep(Duration::from_millis(40)).await;

        sampler.stop().await;
        let len = sampler.session_len();
        assert!(len > 0);
        assert!(!sampler.is_collecting());

        sleep(Duration::from_millis(40)).await;
        assert_eq!(sampler.session_len(), len);
        assert!(!sampler.indicators().is_recording());
        sampler.shutdown();
    }

    #[tokio::test]
    async fn test_stop_after_delay() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        assert!(!sampler.stop_after(Duration::from_millis(10)), "inactive sampler");

        sampler.start();
        assert!(sampler.stop_after(Duration::from_millis(30)));
        assert_eq!(sampler.mode(), SamplerMode::Stopping);
        assert!(sampler.is_collecting());

        sleep(Duration::from_millis(80)).await;
        assert_eq!(sampler.mode(), SamplerMode::Stopped);
    }

    #[tokio::test]
    async fn test_deferred_stop_does_not_clobber_restart() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        sampler.start();
        sampler.stop_after(Duration::from_millis(30));
        sampler.stop().await;
        sampler.start();

        sleep(Duration::from_millis(60)).await;
        assert_eq!(sampler.mode(), SamplerMode::Collecting);
    }

    #[tokio::test]
    async fn test_link_down_stops_and_keeps_session() {
        let mut live = MockLiveModel::new();
        let mut checks = 0;
        live.expect_is_connected().returning(move || {
            checks += 1;
            checks <= 4
        });
        live.expect_snapshot().returning(LiveSnapshot::default);

        let log = Arc::new(FakeLog::default());
        let parts = SamplerParts::new(Arc::new(live)).with_log(log.clone());
        let sampler = TelemetrySampler::new(&test_config(), parts);

        sampler.start();
        sampler.spawn();
        sleep(Duration::from_millis(60)).await;

        assert_eq!(sampler.mode(), SamplerMode::Stopped);
        let len = sampler.session_len();
        assert!(len > 0, "samples collected before link loss are kept");
        assert!(!log.is_logging());
        assert!(!sampler.indicators().is_recording());

        sleep(Duration::from_millis(30)).await;
        assert_eq!(sampler.session_len(), len);
        sampler.shutdown();
    }

    #[tokio::test]
    async fn test_recording_sample_used_while_logging() {
        let log = Arc::new(FakeLog::default());
        let catalog = |raw: &Channels| {
            let mut derived = Channels::new();
            if let Some(z) = raw.get("vehicle_local_position_0.z") {
                derived.insert("altitude".to_string(), -z);
            }
            derived
        };
        let parts = SamplerParts::new(connected_model())
            .with_log(log.clone())
            .with_catalog(Arc::new(catalog));
        let sampler = TelemetrySampler::new(&test_config(), parts);

        sampler.spawn();
        sampler.start();
        sleep(Duration::from_millis(40)).await;
        assert!(log.is_logging());
        assert!(sampler.indicators().is_recording());
        sampler.stop().await;

        let first = sampler.sample_at(0).unwrap();
        assert_eq!(first.value("vehicle_local_position_0.z"), Some(-12.0));
        assert_eq!(first.value("altitude"), Some(12.0));
        assert!(!log.is_logging());
        sampler.shutdown();
    }

    #[tokio::test]
    async fn test_live_sample_used_without_log() {
        let live = connected_model();
        live.update(|s| s.battery.voltage = 12.0);
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(live));

        sampler.spawn();
        sampler.start();
        sleep(Duration::from_millis(40)).await;
        sampler.stop().await;

        let first = sampler.sample_at(0).unwrap();
        assert_eq!(first.value("battery.voltage"), Some(12.0));
        assert!(first.value(COST_CHANNEL).is_some());

        let session = sampler.session();
        assert!(session.windows(2).all(|w| w[0].tms_us <= w[1].tms_us));
        drop(session);
        sampler.shutdown();
    }

    #[tokio::test]
    async fn test_repeated_message_forwarded_once() {
        let live = connected_model();
        live.update(|s| {
            s.message = Some(StatusMessage { tms: 100, severity: 6, text: "Takeoff detected".to_string() })
        });
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(live));

        sampler.spawn();
        sampler.start();
        sleep(Duration::from_millis(50)).await;
        sampler.stop().await;

        let session = sampler.session();
        assert!(session.len() > 1);
        let with_message = session.iter().filter(|s| s.message.is_some()).count();
        assert_eq!(with_message, 1);
        drop(session);
        sampler.shutdown();
    }

    #[tokio::test]
    async fn test_tick_fault_does_not_kill_worker() {
        let parts = SamplerParts::new(connected_model()).with_health(Arc::new(FlakyHealth::default()));
        let sampler = TelemetrySampler::new(&test_config(), parts);

        sampler.spawn();
        sampler.start();
        sleep(Duration::from_millis(50)).await;

        assert!(sampler.session_len() > 0);
        sampler.shutdown();
    }

    #[tokio::test]
    async fn test_subscribe_receives_ticks() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let observer = sampler.subscribe(move |_at| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let mut events = sampler.tick_events();

        sampler.spawn();
        sampler.start();
        let first = events.recv().await.unwrap();
        assert_eq!(first.index, 0);
        sleep(Duration::from_millis(30)).await;

        assert!(count.load(Ordering::SeqCst) > 0);
        observer.abort();
        sampler.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_current_never_mixes_ticks() {
        let live = connected_model();
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(live.clone()));
        sampler.spawn();

        let writer = tokio::spawn(async move {
            for k in 0..200 {
                live.update(|s| {
                    s.channels.insert("a".to_string(), k as f64);
                    s.channels.insert("b".to_string(), k as f64);
                });
                sleep(Duration::from_millis(1)).await;
            }
        });

        for _ in 0..200 {
            let current = sampler.current();
            assert_eq!(current.value("a"), current.value("b"));
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        sampler.shutdown();
    }

    #[test]
    fn test_window_over_loaded_session() {
        let mut config = test_config();
        config.interval_us = 50_000;
        let sampler = TelemetrySampler::new(&config, SamplerParts::new(connected_model()));
        sampler.load_session(stored_samples(1000));

        assert_eq!(sampler.window_samples(), 600);
        assert_eq!(sampler.window_range(0.0), Some(0..=600));
        assert_eq!(sampler.window_range(1.0), Some(400..=999));
        assert_eq!(sampler.last_in_window(0.5).value("index"), Some(800.0));
        assert_eq!(sampler.total_recording_ms(), 999 * 50);
    }

    #[test]
    fn test_window_follows_runtime_settings() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        sampler.set_interval_us(100_000);
        sampler.set_total_window_s(10);
        assert_eq!(sampler.window_samples(), 100);
    }

    #[test]
    fn test_load_session_recomputes_derived() {
        let catalog = |raw: &Channels| {
            raw.get("index")
                .map(|i| Channels::from([("index_x2".to_string(), i * 2.0)]))
                .unwrap_or_default()
        };
        let parts = SamplerParts::new(connected_model()).with_catalog(Arc::new(catalog));
        let sampler = TelemetrySampler::new(&test_config(), parts);
        sampler.start();
        sampler.load_session(stored_samples(3));

        assert_eq!(sampler.mode(), SamplerMode::Stopped);
        assert_eq!(sampler.sample_at(2).unwrap().value("index_x2"), Some(4.0));
        sampler.clear_session();
        assert_eq!(sampler.session_len(), 0);
        assert_eq!(sampler.total_recording_ms(), 0);
    }

    #[tokio::test]
    async fn test_restart_after_load_session_rebases_timestamps() {
        let log = Arc::new(FakeLog::default());
        let parts = SamplerParts::new(connected_model()).with_log(log.clone());
        let sampler = TelemetrySampler::new(&test_config(), parts);
        sampler.spawn();
        sampler.start();
        sleep(Duration::from_millis(100)).await;
        sampler.indicators().set_log_loaded(true);

        // Restart before the worker observes the stop
        sampler.load_session(Vec::new());
        assert!(sampler.start());
        sleep(Duration::from_millis(30)).await;

        let first = sampler.sample_at(0).unwrap();
        assert!(first.tms_us < 20_000, "first sample at {} us", first.tms_us);
        assert!(log.is_logging());
        assert!(sampler.indicators().is_recording());
        assert!(!sampler.indicators().is_log_loaded());
        sampler.shutdown();
    }

    #[test]
    fn test_clear_session_stops_and_resets_working_samples() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        sampler.load_session(stored_samples(4));
        sampler.start();
        sampler.shared.working().current.channels.insert("a".to_string(), 1.0);

        sampler.clear_session();
        assert_eq!(sampler.mode(), SamplerMode::Stopped);
        assert_eq!(sampler.session_len(), 0);
        assert_eq!(sampler.current(), Sample::default());
    }

    #[tokio::test]
    async fn test_clear_session_while_collecting() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        sampler.spawn();
        sampler.start();
        sleep(Duration::from_millis(60)).await;
        assert!(sampler.session_len() > 0);

        sampler.clear_session();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(sampler.session_len(), 0);
        assert!(!sampler.indicators().is_recording());

        assert!(sampler.start());
        sleep(Duration::from_millis(30)).await;
        let first = sampler.sample_at(0).unwrap();
        assert!(first.tms_us < 20_000, "first sample at {} us", first.tms_us);
        sampler.shutdown();
    }

    #[test]
    fn test_last_in_window_while_active_returns_current() {
        let sampler = TelemetrySampler::new(&test_config(), SamplerParts::new(connected_model()));
        sampler.load_session(stored_samples(10));
        sampler.shared.mode.store(SamplerMode::Collecting);
        assert_eq!(sampler.last_in_window(1.0), sampler.current());
    }
}
