//! # Monitoring Cycle and Periodic Driver
//!
//! [`Coordinator`] runs one monitoring cycle: pull a sample, feed the
//! adaptation state machine, broadcast on a freshly armed cycle, and close the
//! cycle with feedback on the following sample.
//!
//! ```text
//! tick N    sample ──> Stable ──trigger──> Adapting ──> broadcast (baseline = sample)
//! tick N+1  sample ──> Adapting ──> feedback(baseline, sample) ──> Stable
//! ```
//!
//! [`Driver`] fires cycles on a fixed interval. Cycles never overlap: a tick
//! that arrives while a cycle is in flight is skipped and logged, never
//! queued. A cycle that fails or panics is logged and the driver carries on
//! with the next tick.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adaptation::{AdaptationDecision, AdaptationEvaluator, ControllerState, Transition};
use crate::auth::TrustedPeerSet;
use crate::broadcast::{Broadcaster, DeliveryReport};
use crate::config::CoordinatorConfig;
use crate::feedback::{FeedbackMonitor, ImprovementReport};
use crate::identity::ControllerId;
use crate::messages::PolicyUpdate;
use crate::metrics::{MetricsSample, MetricsSource};
use crate::protocols::Transport;

/// Milliseconds since the Unix epoch, for update timestamps.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What one monitoring cycle did.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// Nothing breached; no cycle in flight.
    Stable { sample: MetricsSample },
    /// A new adaptation cycle started and its update was broadcast.
    Adapted {
        sample: MetricsSample,
        decision: AdaptationDecision,
        seqno: u64,
        report: DeliveryReport,
    },
    /// The in-flight cycle observed its feedback and closed.
    FeedbackObserved {
        sample: MetricsSample,
        improvement: ImprovementReport,
        /// Triggers folded into the closed cycle instead of starting new ones.
        coalesced: u32,
    },
}

pub struct Coordinator<M: MetricsSource, T: Transport> {
    local: ControllerId,
    trusted: TrustedPeerSet,
    source: M,
    evaluator: AdaptationEvaluator,
    broadcaster: Broadcaster<T>,
    monitor: FeedbackMonitor,
    baseline: Option<MetricsSample>,
    seqno: u64,
}

impl<M: MetricsSource, T: Transport> Coordinator<M, T> {
    pub fn new(
        local: ControllerId,
        trusted: TrustedPeerSet,
        config: &CoordinatorConfig,
        source: M,
        broadcaster: Broadcaster<T>,
    ) -> Self {
        Self {
            local,
            trusted,
            source,
            evaluator: AdaptationEvaluator::from_config(config),
            broadcaster,
            monitor: FeedbackMonitor::new(config.improvement_tolerance),
            baseline: None,
            seqno: 0,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.evaluator.state()
    }

    pub fn local(&self) -> &ControllerId {
        &self.local
    }

    /// Number of policy updates issued so far.
    pub fn issued(&self) -> u64 {
        self.seqno
    }

    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let sample = self
            .source
            .next_sample()
            .await
            .context("metrics source failed")?;
        debug!(
            traffic = sample.traffic_volume(),
            delay = sample.delay(),
            congestion = sample.congestion_alert(),
            "metrics sample"
        );

        if let Some(baseline) = self.baseline.take() {
            // Any trigger in this sample belongs to the cycle being closed.
            self.evaluator.on_sample(&sample);
            let coalesced = self.evaluator.complete_cycle();
            let improvement = self.monitor.observe(&baseline, &sample);
            info!(
                improved = improvement.improved,
                traffic_delta = format!("{:+.2}", improvement.traffic_volume.delta),
                delay_delta = format!("{:+.2}", improvement.delay.delta),
                coalesced,
                "adaptation feedback observed"
            );
            return Ok(CycleOutcome::FeedbackObserved {
                sample,
                improvement,
                coalesced,
            });
        }

        let decision = match self.evaluator.on_sample(&sample) {
            Transition::Armed(decision) => decision,
            Transition::Idle | Transition::Coalesced(_) => {
                return Ok(CycleOutcome::Stable { sample });
            }
        };

        self.seqno += 1;
        let update = PolicyUpdate::for_adaptation(
            self.seqno,
            self.local.clone(),
            now_ms(),
            decision.reasons(),
            sample,
        );
        info!(seqno = self.seqno, reasons = ?decision.reasons(), "adaptation triggered");

        let report = match self
            .broadcaster
            .broadcast(&self.local, &update, &self.trusted)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.evaluator.complete_cycle();
                return Err(e);
            }
        };
        info!(
            seqno = self.seqno,
            delivered = report.delivered(),
            unreachable = report.unreachable(),
            untrusted = report.untrusted(),
            "policy update disseminated"
        );

        self.baseline = Some(sample);
        Ok(CycleOutcome::Adapted {
            sample,
            decision,
            seqno: self.seqno,
            report,
        })
    }
}

/// Counters collected over one [`Driver::run`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub ticks: u64,
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub ticks_skipped: u64,
    /// Highest number of cycles ever running at once.
    pub max_concurrent_cycles: usize,
}

type CycleHandle = JoinHandle<Result<CycleOutcome>>;

/// Marks one cycle as running until dropped, including on panic or abort.
struct RunningCycle {
    active: Arc<AtomicUsize>,
}

impl RunningCycle {
    fn enter(active: Arc<AtomicUsize>, max_active: &AtomicUsize) -> Self {
        let running = active.fetch_add(1, Ordering::SeqCst) + 1;
        max_active.fetch_max(running, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for RunningCycle {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn join_in_flight(slot: &mut Option<CycleHandle>) -> Result<Result<CycleOutcome>, JoinError> {
    match slot.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

pub struct Driver<M: MetricsSource, T: Transport> {
    coordinator: Arc<Mutex<Coordinator<M, T>>>,
    interval: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl<M: MetricsSource, T: Transport> Driver<M, T> {
    pub fn new(coordinator: Coordinator<M, T>, interval: Duration) -> Self {
        Self {
            coordinator: Arc::new(Mutex::new(coordinator)),
            interval,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn coordinator(&self) -> Arc<Mutex<Coordinator<M, T>>> {
        self.coordinator.clone()
    }

    /// Tick until `shutdown` resolves. An in-flight cycle is aborted on
    /// shutdown; there is no state to flush.
    pub async fn run<F>(&self, shutdown: F) -> DriverStats
    where
        F: Future<Output = ()>,
    {
        let mut stats = DriverStats::default();
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<CycleHandle> = None;
        tokio::pin!(shutdown);

        info!(interval_ms = self.interval.as_millis() as u64, "monitoring loop started");
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutdown requested, stopping monitoring loop");
                    break;
                }
                // Reap before ticking so a cycle that just finished does not
                // cost the tick firing alongside it.
                joined = join_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    Self::reap(joined, &mut stats);
                }
                _ = interval.tick() => {
                    stats.ticks += 1;
                    if in_flight.is_some() {
                        stats.ticks_skipped += 1;
                        warn!(tick = stats.ticks, "previous cycle still running, skipping tick");
                        continue;
                    }
                    in_flight = Some(self.spawn_cycle());
                    stats.cycles_started += 1;
                }
            }
        }

        if let Some(handle) = in_flight.take() {
            handle.abort();
            debug!("aborted in-flight cycle");
        }
        stats.max_concurrent_cycles = self.max_active.load(Ordering::SeqCst);
        stats
    }

    fn spawn_cycle(&self) -> CycleHandle {
        let coordinator = self.coordinator.clone();
        let active = self.active.clone();
        let max_active = self.max_active.clone();
        tokio::spawn(async move {
            let _running = RunningCycle::enter(active, &max_active);
            coordinator.lock().await.run_cycle().await
        })
    }

    fn reap(joined: Result<Result<CycleOutcome>, JoinError>, stats: &mut DriverStats) {
        match joined {
            Ok(Ok(outcome)) => {
                stats.cycles_completed += 1;
                debug!(outcome = ?outcome, "cycle completed");
            }
            Ok(Err(e)) => {
                stats.cycles_failed += 1;
                warn!(error = format!("{e:#}"), "monitoring cycle failed");
            }
            Err(e) => {
                stats.cycles_failed += 1;
                warn!(error = %e, "monitoring cycle panicked");
            }
        }
    }
}
