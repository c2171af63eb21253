//! Parameter range calibration
//!
//! The host only reports normalized parameter values. To learn the real range a
//! parameter spans, the calibration actor drives it to 0.0 and 1.0, reads the raw
//! value after each settle delay, then restores it. While probing, the
//! parameter's own change notifications are suppressed and audio is muted so the
//! sweep is neither heard nor reported to listeners.
//!
//! Probing runs on its own task with async settle waits. The scheduler only
//! advances the [`MuteWindow`] countdown, so a consumer awaiting a range from
//! inside `host_callback` never stalls the tick loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::host::{Capability, CapabilityId, Host, PARAMETER_VALUE};

/// Raw bounds of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub low: f64,
    pub high: f64,
}

impl Default for ParameterRange {
    fn default() -> Self {
        Self {
            low: 0.0,
            high: 1.0,
        }
    }
}

/// When a calibrated parameter's notifications come back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Re-enable and notify right after the value is restored
    #[default]
    Immediate,
    /// Keep suppressed until the mute window closes
    Deferred,
}

#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    pub enabled: bool,
    /// Wait after each probe write before reading back
    pub settle: Duration,
    /// Ticks between the end of probing and un-muting
    pub unmute_after_ticks: u32,
    pub flush: FlushMode,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            settle: Duration::from_millis(25),
            unmute_after_ticks: 10,
            flush: FlushMode::Immediate,
        }
    }
}

/// Called with a capability id once its notifications are re-enabled
pub type ReleaseNotifier = Arc<dyn Fn(CapabilityId) + Send + Sync>;

#[derive(Default)]
struct WindowState {
    /// The window is open (probing, or counting down to un-mute)
    pending: bool,
    /// We muted the host and must un-mute it on expiry
    engaged: bool,
    active_probes: usize,
    countdown: Option<u32>,
    held: Vec<CapabilityId>,
}

/// Temporary mute shared by consecutive calibrations
pub struct MuteWindow {
    host: Arc<dyn Host>,
    suppressed: Arc<DashSet<CapabilityId>>,
    notify: ReleaseNotifier,
    state: Mutex<WindowState>,
}

impl MuteWindow {
    pub fn new(
        host: Arc<dyn Host>,
        suppressed: Arc<DashSet<CapabilityId>>,
        notify: ReleaseNotifier,
    ) -> Self {
        Self {
            host,
            suppressed,
            notify,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Start a probe, muting unless audio is already silent or a window is open
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.active_probes += 1;
        // A pending un-mute is reused; its countdown restarts on close
        state.countdown = None;
        if !state.pending {
            state.pending = true;
            if !self.host.is_audio_muted() {
                self.host.set_audio_muted(true);
                state.engaged = true;
                debug!("Audio muted for calibration");
            }
        }
    }

    /// Finish a probe; the last one arms the un-mute countdown
    pub fn close(&self, ticks: u32) {
        let mut state = self.state.lock();
        state.active_probes = state.active_probes.saturating_sub(1);
        if state.active_probes == 0 && state.pending {
            state.countdown = Some(ticks);
        }
    }

    /// Keep a capability suppressed until the window expires
    pub fn hold(&self, id: CapabilityId) {
        self.state.lock().held.push(id);
    }

    /// Re-enable a capability's notifications and fire one
    pub fn release(&self, id: CapabilityId) {
        self.suppressed.remove(&id);
        (self.notify)(id);
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().pending
    }

    /// Advance the countdown by one tick
    pub fn tick(&self) {
        let held = {
            let mut state = self.state.lock();
            match state.countdown {
                Some(n) if n > 1 => {
                    state.countdown = Some(n - 1);
                    return;
                }
                Some(_) => {}
                None => return,
            }

            if state.engaged {
                self.host.set_audio_muted(false);
                debug!("Audio un-muted after calibration");
            }
            state.engaged = false;
            state.pending = false;
            state.countdown = None;
            std::mem::take(&mut state.held)
        };

        for id in held {
            self.release(id);
        }
    }
}

enum CalibrationCommand {
    Range {
        target: Arc<dyn Capability>,
        response: oneshot::Sender<ParameterRange>,
    },
    Cached {
        id: CapabilityId,
        response: oneshot::Sender<Option<ParameterRange>>,
    },
}

/// Owns the range cache and performs probes one at a time
pub struct CalibrationActor {
    settings: CalibrationSettings,
    window: Arc<MuteWindow>,
    suppressed: Arc<DashSet<CapabilityId>>,
    cache: HashMap<CapabilityId, ParameterRange>,
    command_rx: mpsc::UnboundedReceiver<CalibrationCommand>,
}

impl CalibrationActor {
    /// Spawn the actor on the current runtime
    pub fn spawn(
        settings: CalibrationSettings,
        window: Arc<MuteWindow>,
        suppressed: Arc<DashSet<CapabilityId>>,
    ) -> CalibrationHandle {
        let (cmd_tx, command_rx) = mpsc::unbounded_channel();
        let actor = Self {
            settings,
            window,
            suppressed,
            cache: HashMap::new(),
            command_rx,
        };
        tokio::spawn(actor.run());
        CalibrationHandle { cmd_tx }
    }

    async fn run(mut self) {
        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                CalibrationCommand::Range { target, response } => {
                    let range = self.range(target).await;
                    let _ = response.send(range);
                }
                CalibrationCommand::Cached { id, response } => {
                    let _ = response.send(self.cache.get(&id).copied());
                }
            }
        }
        debug!("Calibration actor stopped");
    }

    async fn range(&mut self, target: Arc<dyn Capability>) -> ParameterRange {
        if !self.settings.enabled {
            return ParameterRange::default();
        }

        let id = target.id();
        if let Some(range) = self.cache.get(&id) {
            return *range;
        }

        match self.probe(target.as_ref()).await {
            Ok(range) => {
                info!(%id, low = range.low, high = range.high, "Parameter calibrated");
                // First calibration wins
                *self.cache.entry(id).or_insert(range)
            }
            Err(e) => {
                warn!(%id, "Calibration failed: {:#}", e);
                ParameterRange::default()
            }
        }
    }

    async fn probe(&self, target: &dyn Capability) -> anyhow::Result<ParameterRange> {
        let id = target.id();
        let original = target
            .get(PARAMETER_VALUE)
            .context("reading current value")?;

        self.suppressed.insert(id);
        self.window.open();

        let measured = self.measure(target).await;

        if let Err(e) = target.set(PARAMETER_VALUE, original.clone()) {
            warn!(%id, "Failed to restore value after calibration: {}", e);
        }
        tokio::time::sleep(self.settings.settle).await;

        match (self.settings.flush, measured.is_ok()) {
            (FlushMode::Deferred, true) => self.window.hold(id),
            _ => self.window.release(id),
        }
        self.window.close(self.settings.unmute_after_ticks);

        measured
    }

    async fn measure(&self, target: &dyn Capability) -> anyhow::Result<ParameterRange> {
        target.set(PARAMETER_VALUE, json!(0.0))?;
        tokio::time::sleep(self.settings.settle).await;
        let low = target.get_raw(PARAMETER_VALUE)?;

        target.set(PARAMETER_VALUE, json!(1.0))?;
        tokio::time::sleep(self.settings.settle).await;
        let high = target.get_raw(PARAMETER_VALUE)?;

        Ok(ParameterRange { low, high })
    }
}

/// Handle for requesting calibrations
#[derive(Clone)]
pub struct CalibrationHandle {
    cmd_tx: mpsc::UnboundedSender<CalibrationCommand>,
}

impl CalibrationHandle {
    /// Range of a parameter, probing it the first time
    ///
    /// Falls back to `[0, 1]` if the actor is gone.
    pub async fn range(&self, target: Arc<dyn Capability>) -> ParameterRange {
        let (response_tx, response_rx) = oneshot::channel();
        let cmd = CalibrationCommand::Range {
            target,
            response: response_tx,
        };

        if self.cmd_tx.send(cmd).is_err() {
            return ParameterRange::default();
        }

        response_rx.await.unwrap_or_default()
    }

    /// Cached range, without probing
    pub async fn cached(&self, id: CapabilityId) -> Option<ParameterRange> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(CalibrationCommand::Cached {
                id,
                response: response_tx,
            })
            .is_err()
        {
            return None;
        }

        response_rx.await.ok().flatten()
    }
}
