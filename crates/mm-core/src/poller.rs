//! Continuous acquisition loop.
//!
//! A [`Poller`] repeatedly asks a [`PollSource`] for one sample and hands each
//! result to a [`SampleSink`] until it is stopped or a target count is reached.
//!
//! ```text
//!            start()                 stop()
//!   Idle ───────────────▶ Running ───────────▶ Stopping
//!    ▲                       │                    │
//!    │   count reached /     │                    │ cycle in progress
//!    │   fatal error         ▼                    ▼ finishes
//!    └──────────────────────────────────────────────
//! ```
//!
//! Each running session is one tokio task. Between cycles the task sleeps on
//! `tokio::time`, so tests can drive it with paused time.

use crate::error::{PollError, PollerError};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info};

// =============================================================================
// State & Samples
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollState {
    Idle,
    Running,
    Stopping,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PollState::Idle => "idle",
            PollState::Running => "running",
            PollState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// How many samples a session should deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleCount {
    Finite(u64),
    Unbounded,
}

impl SampleCount {
    fn reached(&self, delivered: u64) -> bool {
        match self {
            SampleCount::Finite(n) => delivered >= *n,
            SampleCount::Unbounded => false,
        }
    }
}

impl From<Option<u64>> for SampleCount {
    fn from(count: Option<u64>) -> Self {
        count.map_or(SampleCount::Unbounded, SampleCount::Finite)
    }
}

/// One acquired value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<S> {
    /// Strictly increasing per poller, starting at 0.
    pub seq: u64,
    pub acquired_at: Instant,
    pub value: S,
}

/// What a sink receives.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent<S> {
    Sample(Sample<S>),
    /// A fatal failure. Sent at most once per session, as its last event.
    Failed(PollError),
}

impl<S> PollEvent<S> {
    pub fn into_sample(self) -> Option<Sample<S>> {
        match self {
            PollEvent::Sample(sample) => Some(sample),
            PollEvent::Failed(_) => None,
        }
    }

    /// Transform the sample value, keeping sequence number and timestamp.
    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> PollEvent<T> {
        match self {
            PollEvent::Sample(s) => PollEvent::Sample(Sample {
                seq: s.seq,
                acquired_at: s.acquired_at,
                value: f(s.value),
            }),
            PollEvent::Failed(err) => PollEvent::Failed(err),
        }
    }
}

// =============================================================================
// Source & Sink Traits
// =============================================================================

/// Produces one sample per call.
///
/// Return `PollError::Transient` for conditions expected to clear on their
/// own (device not ready, a timed out read) and `PollError::Fatal` when the
/// device or channel is gone.
#[async_trait]
pub trait PollSource: Send + 'static {
    type Sample: Clone + Send + Sync + 'static;

    async fn poll_once(&mut self) -> Result<Self::Sample, PollError>;
}

/// Consumes poll events.
#[async_trait]
pub trait SampleSink<S>: Send + Sync + 'static {
    async fn deliver(&self, event: PollEvent<S>);
}

#[async_trait]
impl<S: Send + 'static> SampleSink<S> for mpsc::Sender<PollEvent<S>> {
    async fn deliver(&self, event: PollEvent<S>) {
        // A dropped receiver means nobody is listening; keep polling.
        let _ = self.send(event).await;
    }
}

#[async_trait]
impl<S: Send + 'static> SampleSink<S> for mpsc::UnboundedSender<PollEvent<S>> {
    async fn deliver(&self, event: PollEvent<S>) {
        let _ = self.send(event);
    }
}

#[async_trait]
impl<S: Clone + Send + 'static> SampleSink<S> for broadcast::Sender<PollEvent<S>> {
    async fn deliver(&self, event: PollEvent<S>) {
        let _ = self.send(event);
    }
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

#[async_trait]
impl<S, F> SampleSink<S> for FnSink<F>
where
    S: Send + 'static,
    F: Fn(PollEvent<S>) + Send + Sync + 'static,
{
    async fn deliver(&self, event: PollEvent<S>) {
        (self.0)(event);
    }
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    /// Sleep after a transient failure.
    pub backoff: Duration,
    /// Escalate to fatal after this many transient failures in a row.
    pub max_consecutive_transient: Option<u32>,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(50),
            max_consecutive_transient: None,
        }
    }
}

// =============================================================================
// Poller
// =============================================================================

struct Shared<P: PollSource> {
    name: String,
    source: Mutex<P>,
    sink: Box<dyn SampleSink<P::Sample>>,
    state: watch::Sender<PollState>,
    settings: PollerSettings,
    next_seq: AtomicU64,
    delivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Completed,
    Stopped,
    Failed,
}

/// Drives a [`PollSource`] on its own task.
///
/// Dropping the poller requests stop; a cycle in progress still completes.
pub struct Poller<P: PollSource> {
    shared: Arc<Shared<P>>,
}

impl<P: PollSource> Poller<P> {
    pub fn new(
        source: P,
        sink: impl SampleSink<P::Sample>,
        settings: PollerSettings,
    ) -> Self {
        Self::named("poller", source, sink, settings)
    }

    /// Like [`new`](Self::new), with a name used in log events.
    pub fn named(
        name: impl Into<String>,
        source: P,
        sink: impl SampleSink<P::Sample>,
        settings: PollerSettings,
    ) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                source: Mutex::new(source),
                sink: Box::new(sink),
                state,
                settings,
                next_seq: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Begin a session.
    ///
    /// `interval` is the pause after each delivered sample. Fails with
    /// `AlreadyRunning` unless the poller is `Idle`.
    ///
    /// # Panics
    ///
    /// The session runs as a spawned task, so this must be called from
    /// within a Tokio runtime.
    pub fn start(&self, count: SampleCount, interval: Duration) -> Result<(), PollerError> {
        let mut refused = None;
        self.shared.state.send_if_modified(|state| {
            if *state == PollState::Idle {
                *state = PollState::Running;
                true
            } else {
                refused = Some(*state);
                false
            }
        });
        if let Some(state) = refused {
            return Err(PollerError::AlreadyRunning(state));
        }

        self.shared.delivered.store(0, Ordering::SeqCst);
        info!(poller = %self.shared.name, ?count, ?interval, "poll session started");
        tokio::spawn(run_session(self.shared.clone(), count, interval));
        Ok(())
    }

    /// Request the running session to end. A no-op unless `Running`.
    pub fn stop(&self) {
        request_stop(&self.shared);
    }

    /// Run exactly one cycle outside the session loop.
    ///
    /// The sample is delivered to the sink and returned. It does not count
    /// toward a running session's target.
    pub async fn poll_once(&self) -> Result<Sample<P::Sample>, PollError> {
        let mut source = self.shared.source.lock().await;
        let sample = self.shared.acquire(&mut source).await?;
        self.shared
            .sink
            .deliver(PollEvent::Sample(sample.clone()))
            .await;
        Ok(sample)
    }

    pub fn state(&self) -> PollState {
        *self.shared.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PollState::Running
    }

    /// Resolve once the poller is `Idle`.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.state.subscribe();
        loop {
            if *rx.borrow_and_update() == PollState::Idle {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<PollState> {
        self.shared.state.subscribe()
    }

    /// Samples delivered by the current or last session.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }
}

impl<P: PollSource> Drop for Poller<P> {
    fn drop(&mut self) {
        request_stop(&self.shared);
    }
}

impl<P: PollSource> fmt::Debug for Poller<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("delivered", &self.delivered())
            .finish()
    }
}

fn request_stop<P: PollSource>(shared: &Shared<P>) {
    let stopped = shared.state.send_if_modified(|state| {
        if *state == PollState::Running {
            *state = PollState::Stopping;
            true
        } else {
            false
        }
    });
    if stopped {
        info!(poller = %shared.name, "stop requested");
    }
}

impl<P: PollSource> Shared<P> {
    async fn acquire(&self, source: &mut P) -> Result<Sample<P::Sample>, PollError> {
        let value = source.poll_once().await?;
        Ok(Sample {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            acquired_at: Instant::now(),
            value,
        })
    }

    fn is_running(&self) -> bool {
        *self.state.borrow() == PollState::Running
    }
}

async fn run_session<P: PollSource>(shared: Arc<Shared<P>>, count: SampleCount, interval: Duration) {
    let mut state_rx = shared.state.subscribe();
    let mut consecutive_transient: u32 = 0;

    let end = loop {
        if !shared.is_running() {
            break SessionEnd::Stopped;
        }
        if count.reached(shared.delivered.load(Ordering::SeqCst)) {
            break SessionEnd::Completed;
        }

        let result = {
            let mut source = shared.source.lock().await;
            match shared.acquire(&mut source).await {
                Ok(sample) => {
                    shared.sink.deliver(PollEvent::Sample(sample)).await;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };

        match result {
            Ok(()) => {
                consecutive_transient = 0;
                let delivered = shared.delivered.fetch_add(1, Ordering::SeqCst) + 1;
                if count.reached(delivered) {
                    break SessionEnd::Completed;
                }
                pause(&mut state_rx, interval).await;
            }
            Err(PollError::Transient(reason)) => {
                consecutive_transient += 1;
                if let Some(max) = shared.settings.max_consecutive_transient {
                    if consecutive_transient > max {
                        let err = PollError::fatal(format!(
                            "{} consecutive transient failures, last: {}",
                            consecutive_transient, reason
                        ));
                        error!(poller = %shared.name, error = %err, "poll session failed");
                        shared.sink.deliver(PollEvent::Failed(err)).await;
                        break SessionEnd::Failed;
                    }
                }
                debug!(
                    poller = %shared.name,
                    attempt = consecutive_transient,
                    reason = %reason,
                    "transient poll failure, backing off"
                );
                pause(&mut state_rx, shared.settings.backoff).await;
            }
            Err(err) => {
                error!(poller = %shared.name, error = %err, "poll session failed");
                shared.sink.deliver(PollEvent::Failed(err)).await;
                break SessionEnd::Failed;
            }
        }
    };

    shared.state.send_replace(PollState::Idle);
    info!(
        poller = %shared.name,
        outcome = ?end,
        delivered = shared.delivered.load(Ordering::SeqCst),
        "poll session ended"
    );
}

/// Sleep for `period`, waking early once the session leaves `Running`.
async fn pause(state: &mut watch::Receiver<PollState>, period: Duration) {
    if period.is_zero() {
        tokio::task::yield_now().await;
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => {}
        _ = left_running(state) => {}
    }
}

async fn left_running(state: &mut watch::Receiver<PollState>) {
    loop {
        if *state.borrow_and_update() != PollState::Running {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted outcomes, then repeats the last value forever.
    struct Scripted {
        outcomes: VecDeque<Result<u32, PollError>>,
        calls: Arc<AtomicU64>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<u32, PollError>>) -> (Self, Arc<AtomicU64>) {
            let calls = Arc::new(AtomicU64::new(0));
            (
                Self {
                    outcomes: outcomes.into(),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl PollSource for Scripted {
        type Sample = u32;

        async fn poll_once(&mut self) -> Result<u32, PollError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcomes.len() {
                0 => Ok(0),
                1 => self.outcomes[0].clone(),
                _ => self.outcomes.pop_front().unwrap_or(Ok(0)),
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PollEvent<u32>>) -> Vec<PollEvent<u32>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn sample_count_targets() {
        assert!(SampleCount::Finite(0).reached(0));
        assert!(!SampleCount::Finite(2).reached(1));
        assert!(!SampleCount::Unbounded.reached(u64::MAX));
        assert_eq!(SampleCount::from(None), SampleCount::Unbounded);
    }

    #[test]
    #[should_panic]
    fn start_outside_a_runtime_panics() {
        let (source, _) = Scripted::new(vec![Ok(1)]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let poller = Poller::new(source, tx, PollerSettings::default());
        let _ = poller.start(SampleCount::Finite(1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn finite_zero_settles_without_polling() {
        let (source, calls) = Scripted::new(vec![Ok(1)]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let poller = Poller::new(source, tx, PollerSettings::default());

        poller.start(SampleCount::Finite(0), Duration::from_millis(10)).unwrap();
        poller.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(poller.delivered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_from_idle_is_noop() {
        let (source, _) = Scripted::new(vec![Ok(1)]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let poller = Poller::new(source, tx, PollerSettings::default());

        poller.stop();
        poller.stop();
        assert_eq!(poller.state(), PollState::Idle);
        assert!(poller.start(SampleCount::Finite(1), Duration::ZERO).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_once_delivers_and_returns() {
        let (source, _) = Scripted::new(vec![Ok(7), Ok(8)]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = Poller::new(source, tx, PollerSettings::default());

        let sample = poller.poll_once().await.unwrap();
        assert_eq!((sample.seq, sample.value), (0, 7));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].clone().into_sample().map(|s| s.value), Some(7));
        assert_eq!(poller.state(), PollState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_escalates_after_limit() {
        let (source, calls) = Scripted::new(vec![Err(PollError::transient("not ready"))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let settings = PollerSettings {
            backoff: Duration::from_millis(5),
            max_consecutive_transient: Some(3),
        };
        let poller = Poller::new(source, tx, settings);

        poller.start(SampleCount::Unbounded, Duration::ZERO).unwrap();
        poller.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PollEvent::Failed(e) if e.is_fatal()));
    }

    #[tokio::test(start_paused = true)]
    async fn fn_sink_sees_mapped_events() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = seen.clone();
        let sink = FnSink(move |event: PollEvent<u32>| {
            if let Some(sample) = event.map(|v| v * 10).into_sample() {
                log.lock().push(sample.value);
            }
        });
        let (source, _) = Scripted::new(vec![Ok(1), Ok(2), Ok(3)]);
        let poller = Poller::new(source, sink, PollerSettings::default());

        poller.start(SampleCount::Finite(3), Duration::from_millis(1)).unwrap();
        poller.wait_idle().await;
        assert_eq!(*seen.lock(), vec![10, 20, 30]);
    }
}
