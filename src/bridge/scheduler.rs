//! Fixed-period tick loop
//!
//! The scheduler is the single drainer of the deferred and MIDI queues. Each
//! tick runs the queued listener callbacks, reports a pending project reload,
//! then hands the tick's MIDI batch to the consumer. A failure in any one step is
//! logged and counted, never propagated.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::calibration::MuteWindow;
use super::queue::QueueConsumer;
use super::registry::Deferred;
use super::watchdog::ReadinessWatchdog;
use crate::consumer::ConsumerSlot;
use crate::host::Host;
use crate::midi::RawEvent;

/// Shown once when the script never registers
pub const WATCHDOG_MESSAGE: &str = "Script did not register in time, check its error output in the log";

/// Counters accumulated over the scheduler's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub ticks: u64,
    pub callbacks_run: u64,
    pub callbacks_failed: u64,
    pub deliveries: u64,
    pub deliveries_failed: u64,
    pub project_loads: u64,
    pub midi_events: u64,
}

pub struct Scheduler {
    host: Arc<dyn Host>,
    consumer: Arc<ConsumerSlot>,
    deferred: QueueConsumer<Deferred>,
    midi: QueueConsumer<RawEvent>,
    window: Arc<MuteWindow>,
    watchdog: ReadinessWatchdog,
    project_dirty: Arc<AtomicBool>,
    stats: TickStats,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        host: Arc<dyn Host>,
        consumer: Arc<ConsumerSlot>,
        deferred: QueueConsumer<Deferred>,
        midi: QueueConsumer<RawEvent>,
        window: Arc<MuteWindow>,
        watchdog: ReadinessWatchdog,
        project_dirty: Arc<AtomicBool>,
    ) -> Self {
        Self {
            host,
            consumer,
            deferred,
            midi,
            window,
            watchdog,
            project_dirty,
            stats: TickStats::default(),
        }
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn watchdog(&self) -> &ReadinessWatchdog {
        &self.watchdog
    }

    /// Run one tick
    pub async fn tick(&mut self) {
        self.stats.ticks += 1;
        self.window.tick();

        let Some(consumer) = self.consumer.get() else {
            if self.watchdog.advance() {
                warn!(ticks = self.stats.ticks, "Script has not registered");
                self.host.errorln(WATCHDOG_MESSAGE);
                self.host.show_notification(WATCHDOG_MESSAGE);
            }
            return;
        };
        self.watchdog.cancel();

        for job in self.deferred.drain_all() {
            match std::panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(())) => self.stats.callbacks_run += 1,
                Ok(Err(e)) => {
                    self.stats.callbacks_failed += 1;
                    warn!("Listener callback failed: {:#}", e);
                }
                Err(_) => {
                    self.stats.callbacks_failed += 1;
                    error!("Listener callback panicked");
                }
            }
        }

        if self.project_dirty.swap(false, Ordering::SeqCst) {
            self.stats.project_loads += 1;
            let c = consumer.clone();
            if !deliver("on_project_load", async move { c.on_project_load().await }).await {
                self.stats.deliveries_failed += 1;
            }
        }

        let batch = self.midi.drain_all();
        if !batch.is_empty() {
            trace!(count = batch.len(), first = %batch[0], "MIDI batch");
        }
        self.stats.midi_events += batch.len() as u64;
        self.stats.deliveries += 1;
        if !deliver("host_callback", async move { consumer.host_callback(batch).await }).await {
            self.stats.deliveries_failed += 1;
        }
    }

    /// Start ticking at a fixed period; a scheduler runs at most once
    pub fn start(mut self, period: Duration) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            info!(period_ms = period.as_millis() as u64, "Scheduler started");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => self.tick().await,
                }
            }

            info!(
                ticks = self.stats.ticks,
                callbacks_failed = self.stats.callbacks_failed,
                deliveries_failed = self.stats.deliveries_failed,
                "Scheduler stopped"
            );
            self.stats
        });

        SchedulerHandle { stop_tx, task }
    }
}

/// Run a consumer entry point on its own task so a panic stays contained
pub(crate) async fn deliver<F>(entry: &'static str, call: F) -> bool
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(entry, "Consumer call failed: {:#}", e);
            false
        }
        Err(e) if e.is_panic() => {
            error!(entry, "Consumer call panicked");
            false
        }
        Err(e) => {
            debug!(entry, "Consumer call cancelled: {}", e);
            false
        }
    }
}

/// Handle to a running scheduler
pub struct SchedulerHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<TickStats>,
}

impl SchedulerHandle {
    /// Stop after the in-flight tick and return the final counters
    pub async fn stop(self) -> TickStats {
        let _ = self.stop_tx.send(());
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Scheduler task failed: {}", e);
                TickStats::default()
            }
        }
    }
}
