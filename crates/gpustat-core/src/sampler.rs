//! Continuous sampling of device metrics.
//!
//! A [`SamplingSession`] runs the query engine on a background thread at a
//! fixed period and buffers timestamped [`Sample`]s. Its lifecycle is
//! one-way: `Idle → Running → Stopped`.
//!
//! Pacing is measured from tick start to tick start. Query latency is
//! subtracted from the sleep, so the long-run period stays close to the
//! configured one. A tick that overruns the period is followed immediately
//! by the next one; ticks are never skipped.
//!
//! The background thread checks for the stop signal between ticks and while
//! sleeping, never during a query. `stop()` waits for the thread to exit.
//! If a tick fails, the thread records the error and exits; the session then
//! reports [`SessionState::Failed`] until `stop()` is called.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, QueryError};
use crate::query::{DeviceData, QueryEngine};

/// One timestamped snapshot across a device set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub data: DeviceData,
}

/// What to sample and how often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfig {
    pub period: Duration,
    pub devices: Vec<u32>,
    pub metrics: Vec<String>,
}

impl SamplerConfig {
    pub fn new<I, S>(period: Duration, devices: Vec<u32>, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            period,
            devices,
            metrics: metrics.into_iter().map(Into::into).collect(),
        }
    }
}

/// Observable state of a [`SamplingSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet started.
    Idle,
    /// Sampling in the background.
    Running,
    /// The background thread stopped on an error; call `stop()` to finish.
    Failed,
    /// Stopped; the buffer no longer changes.
    Stopped,
}

enum Lifecycle {
    Idle,
    Running {
        stop_tx: Sender<()>,
        worker: JoinHandle<()>,
    },
    Stopped,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Wall clock anchored to a monotonic origin, so timestamps never go
/// backwards even if the system clock is adjusted.
struct Clock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.origin.elapsed())
            .map(|elapsed| self.wall + elapsed)
            .unwrap_or(self.wall)
    }
}

/// Tick-start to tick-start pacing.
struct Pacer {
    period: Duration,
    last_tick: Option<Instant>,
}

impl Pacer {
    fn new(period: Duration) -> Self {
        Self {
            period,
            last_tick: None,
        }
    }

    /// Time left until the next tick is due. Zero for the first tick and
    /// when the previous tick overran.
    fn remaining(&self) -> Duration {
        self.last_tick
            .map(|last| self.period.saturating_sub(last.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    fn tick(&mut self) {
        self.last_tick = Some(Instant::now());
    }
}

fn take_sample(
    engine: &QueryEngine,
    config: &SamplerConfig,
    clock: &Clock,
) -> Result<Sample, QueryError> {
    let timestamp = clock.now();
    let data = engine.query_devices(&config.devices, &config.metrics)?;
    Ok(Sample { timestamp, data })
}

/// State moved into the background thread.
struct Worker {
    engine: Arc<QueryEngine>,
    config: SamplerConfig,
    stop_rx: Receiver<()>,
    samples: Arc<Mutex<Vec<Sample>>>,
    failure: Arc<Mutex<Option<QueryError>>>,
}

impl Worker {
    fn run(self) {
        let clock = Clock::start();
        let mut pacer = Pacer::new(self.config.period);
        let period_ms = self.config.period.as_millis() as u64;
        let mut ticks: u64 = 0;

        loop {
            if !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }
            let wait = pacer.remaining();
            if !wait.is_zero() {
                match self.stop_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            pacer.tick();
            let start = Instant::now();
            match take_sample(&self.engine, &self.config, &clock) {
                Ok(sample) => {
                    ticks += 1;
                    lock(&self.samples).push(sample);
                }
                Err(e) => {
                    error!(error = %e, ticks, "sampling tick failed, stopping session");
                    *lock(&self.failure) = Some(e);
                    break;
                }
            }

            let duration_ms = start.elapsed().as_millis() as u64;
            debug!(
                tick = ticks,
                duration_ms,
                devices = ?self.config.devices,
                "tick completed"
            );
            if period_ms > 0 && duration_ms > period_ms {
                warn!(duration_ms, period_ms, "tick exceeded sampling period");
            }
        }

        debug!(ticks, "sampler thread exiting");
    }
}

/// A background sampling session.
///
/// Samples are appended only by the session's own thread; callers read
/// them through [`get_results`](Self::get_results).
pub struct SamplingSession {
    engine: Arc<QueryEngine>,
    config: SamplerConfig,
    lifecycle: Lifecycle,
    samples: Arc<Mutex<Vec<Sample>>>,
    failure: Arc<Mutex<Option<QueryError>>>,
}

impl SamplingSession {
    /// Creates an idle session.
    ///
    /// Fails if the devices or metrics are invalid, a derived metric lacks a
    /// dynamic dependency, or a static metric is requested.
    pub fn new(engine: Arc<QueryEngine>, config: SamplerConfig) -> Result<Self, QueryError> {
        engine.validate_monitoring(&config.devices, &config.metrics)?;
        Ok(Self {
            engine,
            config,
            lifecycle: Lifecycle::Idle,
            samples: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        match self.lifecycle {
            Lifecycle::Idle => SessionState::Idle,
            Lifecycle::Running { .. } if lock(&self.failure).is_some() => SessionState::Failed,
            Lifecycle::Running { .. } => SessionState::Running,
            Lifecycle::Stopped => SessionState::Stopped,
        }
    }

    /// Starts sampling on a background thread. Valid only once, from `Idle`.
    pub fn start(&mut self) -> Result<(), QueryError> {
        match self.lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => return Err(LifecycleError::AlreadyStarted.into()),
            Lifecycle::Stopped => return Err(LifecycleError::AlreadyStopped.into()),
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = Worker {
            engine: self.engine.clone(),
            config: self.config.clone(),
            stop_rx,
            samples: self.samples.clone(),
            failure: self.failure.clone(),
        };
        let worker = thread::spawn(move || worker.run());

        info!(
            period_ms = self.config.period.as_millis() as u64,
            devices = ?self.config.devices,
            metrics = ?self.config.metrics,
            "sampling session started"
        );
        self.lifecycle = Lifecycle::Running { stop_tx, worker };
        Ok(())
    }

    /// Signals the background thread and waits for it to exit.
    ///
    /// Valid from `Running` or `Failed`. May block for up to one in-flight
    /// query. A recorded failure stays available through [`failure`](Self::failure).
    pub fn stop(&mut self) -> Result<(), QueryError> {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { stop_tx, worker } => {
                // The worker may already be gone after a failure.
                let _ = stop_tx.send(());
                if worker.join().is_err() {
                    error!("sampler thread panicked");
                }
                info!(samples = self.sample_count(), "sampling session stopped");
                Ok(())
            }
            Lifecycle::Idle => {
                self.lifecycle = Lifecycle::Idle;
                Err(LifecycleError::NotRunning.into())
            }
            Lifecycle::Stopped => Err(LifecycleError::AlreadyStopped.into()),
        }
    }

    /// Snapshot of the samples collected so far.
    pub fn get_results(&self) -> Vec<Sample> {
        lock(&self.samples).clone()
    }

    pub fn sample_count(&self) -> usize {
        lock(&self.samples).len()
    }

    /// The error that ended the background thread, if any.
    pub fn failure(&self) -> Option<QueryError> {
        lock(&self.failure).clone()
    }
}

impl Drop for SamplingSession {
    fn drop(&mut self) {
        if let Lifecycle::Running { stop_tx, worker } =
            std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped)
        {
            let _ = stop_tx.send(());
            let _ = worker.join();
        }
    }
}

/// Samples in the calling thread until `total` has elapsed.
///
/// Validation and pacing are the same as for a [`SamplingSession`]; the
/// first error ends collection and is returned.
pub fn collect_for(
    engine: &QueryEngine,
    config: &SamplerConfig,
    total: Duration,
) -> Result<Vec<Sample>, QueryError> {
    engine.validate_monitoring(&config.devices, &config.metrics)?;

    let clock = Clock::start();
    let start = Instant::now();
    let mut pacer = Pacer::new(config.period);
    let mut samples = Vec::new();

    while start.elapsed() <= total {
        thread::sleep(pacer.remaining());
        pacer.tick();
        samples.push(take_sample(engine, config, &clock)?);
    }

    debug!(samples = samples.len(), "collection finished");
    Ok(samples)
}
