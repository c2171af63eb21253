//! Event bridge
//!
//! Ties the host's observers to the consumer: observers feed the subscription
//! registry, which feeds the deferred queue; MIDI input feeds the event queue;
//! the [`Scheduler`] drains both every tick. [`Bridge`] carries every operation
//! the consumer can call back into.

pub mod banks;
pub mod calibration;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod watchdog;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::BridgeConfig;
use crate::consumer::{Consumer, ConsumerSlot};
use crate::error::{BridgeError, HostError};
use crate::host::{CapabilityId, CapabilityInfo, CapabilityKind, Host, PARAMETER_VALUE};
use crate::midi::{format_hex, RawEvent, TransportCommand};

use banks::Banks;
use calibration::{CalibrationActor, CalibrationHandle, MuteWindow, ParameterRange};
use queue::{QueueDiscard, QueueProducer};
use registry::{Deferred, ListenerCallback, ListenerId, OwnerId, SharedRegistry};
use watchdog::ReadinessWatchdog;

pub use scheduler::{Scheduler, SchedulerHandle, TickStats};

pub struct Bridge {
    host: Arc<dyn Host>,
    banks: Banks,
    registry: SharedRegistry,
    deferred_tx: QueueProducer<Deferred>,
    midi_tx: QueueProducer<RawEvent>,
    stale_deferred: QueueDiscard<Deferred>,
    stale_midi: QueueDiscard<RawEvent>,
    consumer: Arc<ConsumerSlot>,
    /// Held while the slot changes together with the MIDI callbacks
    lifecycle: Mutex<()>,
    calibration: CalibrationHandle,
    project_dirty: Arc<AtomicBool>,
    next_owner: AtomicU64,
}

impl Bridge {
    /// Build the bridge and its (not yet started) scheduler
    ///
    /// Must be called inside a tokio runtime: the calibration actor is spawned here.
    pub fn new(
        host: Arc<dyn Host>,
        config: &BridgeConfig,
    ) -> Result<(Arc<Self>, Scheduler), BridgeError> {
        let (deferred_tx, deferred_rx) = queue::channel::<Deferred>();
        let (midi_tx, midi_rx) = queue::channel::<RawEvent>();
        let registry = SharedRegistry::new();
        let suppressed = Arc::new(DashSet::new());

        let banks = Banks::build(host.as_ref(), &config.banks);
        banks.wire(&registry, &deferred_tx, &suppressed)?;

        let notify = {
            let registry = registry.clone();
            let sink = deferred_tx.clone();
            Arc::new(move |id: CapabilityId| {
                registry.fire(id, PARAMETER_VALUE, &sink);
            })
        };
        let window = Arc::new(MuteWindow::new(host.clone(), suppressed.clone(), notify));
        let calibration =
            CalibrationActor::spawn(config.calibration.settings(), window.clone(), suppressed);

        let project_dirty = Arc::new(AtomicBool::new(false));
        {
            let dirty = project_dirty.clone();
            host.watch_project(Arc::new(move || {
                dirty.store(true, Ordering::SeqCst);
            }));
        }

        let stale_deferred = deferred_rx.discarder();
        let stale_midi = midi_rx.discarder();

        let consumer = Arc::new(ConsumerSlot::new());
        let scheduler = Scheduler::new(
            host.clone(),
            consumer.clone(),
            deferred_rx,
            midi_rx,
            window,
            ReadinessWatchdog::new(config.watchdog.threshold_ticks),
            project_dirty.clone(),
        );

        let bridge = Arc::new(Self {
            host,
            banks,
            registry,
            deferred_tx,
            midi_tx,
            stale_deferred,
            stale_midi,
            consumer,
            lifecycle: Mutex::new(()),
            calibration,
            project_dirty,
            next_owner: AtomicU64::new(1),
        });

        Ok((bridge, scheduler))
    }

    // =========================================================================
    // Consumer lifecycle
    // =========================================================================

    /// Register the consumer and start delivering to it
    ///
    /// Work queued before this point is discarded. Runs `on_script_start`
    /// then `on_project_load`, then installs the MIDI input callbacks. A late
    /// registration (after the watchdog fired) is still accepted.
    pub async fn register_consumer(&self, consumer: Arc<dyn Consumer>) {
        // Registration reports the current project itself
        self.project_dirty.store(false, Ordering::SeqCst);
        self.discard_pending();

        let c = consumer.clone();
        scheduler::deliver("on_script_start", async move { c.on_script_start().await }).await;
        let c = consumer.clone();
        scheduler::deliver("on_project_load", async move { c.on_project_load().await }).await;

        let previous = {
            let _lifecycle = self.lifecycle.lock();
            let previous = self.consumer.set(consumer);
            self.install_midi_callbacks();
            previous
        };
        if let Some(previous) = previous {
            warn!("Consumer re-registered, stopping the previous one");
            scheduler::deliver("on_script_stop", async move { previous.on_script_stop().await })
                .await;
        }
        info!("Consumer registered");
    }

    /// Unregister the consumer, calling its `on_script_stop`
    ///
    /// Returns false if nothing was registered.
    pub async fn unregister_consumer(&self) -> bool {
        let taken = {
            let _lifecycle = self.lifecycle.lock();
            let taken = self.consumer.take();
            if taken.is_some() {
                self.host.clear_midi_callbacks();
            }
            taken
        };
        let Some(consumer) = taken else {
            return false;
        };
        scheduler::deliver("on_script_stop", async move { consumer.on_script_stop().await }).await;
        info!("Consumer unregistered");
        true
    }

    /// Drop a consumer whose peer went away, without calling into it
    pub fn detach_consumer(&self, consumer: &Arc<dyn Consumer>) -> bool {
        let detached = {
            let _lifecycle = self.lifecycle.lock();
            let detached = self.consumer.take_if(consumer);
            if detached {
                self.host.clear_midi_callbacks();
            }
            detached
        };
        if detached {
            warn!("Consumer detached, its connection closed");
        }
        detached
    }

    pub fn is_registered(&self) -> bool {
        self.consumer.is_registered()
    }

    fn discard_pending(&self) {
        let deferred = self.stale_deferred.discard();
        let midi = self.stale_midi.discard();
        if deferred + midi > 0 {
            debug!(deferred, midi, "Discarded work queued before registration");
        }
    }

    fn install_midi_callbacks(&self) {
        let midi_tx = self.midi_tx.clone();
        let transport = self.banks.transport().clone();

        self.host.set_midi_callbacks(
            Arc::new(move |event: RawEvent| {
                midi_tx.push(event);
            }),
            Arc::new(move |data: &[u8]| match TransportCommand::from_sysex(data) {
                Some(command) => {
                    debug!(action = command.action(), "MMC transport command");
                    if let Err(e) = transport.invoke(command.action()) {
                        warn!("Transport command failed: {}", e);
                    }
                }
                None => trace!("Ignoring SysEx {}", format_hex(data)),
            }),
        );
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Mint an id for a session that adds listeners
    pub fn new_owner(&self) -> OwnerId {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to changes of a capability property on behalf of `owner`
    pub fn add_listener(
        &self,
        owner: OwnerId,
        target: CapabilityId,
        property: &str,
        id: ListenerId,
        callback: ListenerCallback,
    ) -> Result<(), BridgeError> {
        let capability = self.banks.require(target)?;
        if !capability.properties().iter().any(|p| *p == property) {
            return Err(HostError::UnknownProperty {
                kind: capability.kind(),
                property: property.to_string(),
            }
            .into());
        }
        self.registry.add(owner, target, property, id, callback);
        Ok(())
    }

    /// Remove every subscription with this id; returns how many were removed
    pub fn remove_listener(&self, target: CapabilityId, property: &str, id: ListenerId) -> usize {
        self.registry.remove(target, property, id)
    }

    /// Remove every subscription `owner` added; returns how many were removed
    pub fn drop_listeners(&self, owner: OwnerId) -> usize {
        self.registry.remove_owner(owner)
    }

    /// Queue work for the next tick
    pub fn defer(&self, job: Deferred) -> bool {
        self.deferred_tx.push(job)
    }

    // =========================================================================
    // Banks
    // =========================================================================

    pub fn track_bank(&self) -> Vec<CapabilityInfo> {
        self.banks.tracks()
    }

    pub fn device_bank(&self, track: CapabilityId) -> Result<Vec<CapabilityInfo>, BridgeError> {
        self.banks.devices(track)
    }

    pub fn parameter_bank(&self, device: CapabilityId) -> Result<Vec<CapabilityInfo>, BridgeError> {
        self.banks.parameters(device)
    }

    /// Raw range of a parameter, calibrating it on first request
    pub async fn parameter_range(&self, parameter: CapabilityId) -> Result<ParameterRange, BridgeError> {
        let capability = self.banks.require(parameter)?;
        if capability.kind() != CapabilityKind::Parameter {
            return Err(HostError::UnknownProperty {
                kind: capability.kind(),
                property: PARAMETER_VALUE.to_string(),
            }
            .into());
        }
        Ok(self.calibration.range(capability.clone()).await)
    }

    // =========================================================================
    // Capability accessors
    // =========================================================================

    pub fn get_value(&self, target: CapabilityId, property: &str) -> Result<Value, BridgeError> {
        Ok(self.banks.require(target)?.get(property)?)
    }

    pub fn get_raw(&self, target: CapabilityId, property: &str) -> Result<f64, BridgeError> {
        Ok(self.banks.require(target)?.get_raw(property)?)
    }

    pub fn set_value(
        &self,
        target: CapabilityId,
        property: &str,
        value: Value,
    ) -> Result<(), BridgeError> {
        Ok(self.banks.require(target)?.set(property, value)?)
    }

    pub fn invoke(&self, target: CapabilityId, action: &str) -> Result<(), BridgeError> {
        Ok(self.banks.require(target)?.invoke(action)?)
    }

    pub fn transport_info(&self) -> CapabilityInfo {
        self.banks.transport().info()
    }

    // =========================================================================
    // Host surface
    // =========================================================================

    /// Write a line to the host log on behalf of the script
    pub fn log(&self, message: &str) {
        self.host.println(message);
    }

    pub fn notify(&self, message: &str) {
        self.host.show_notification(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::testing::{Call, RecordingConsumer};
    use crate::host::sim::LogLine;
    use crate::host::{Capability, SimHost, SimLayout};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::thread;

    fn setup() -> (Arc<SimHost>, Arc<Bridge>, Scheduler) {
        let host = Arc::new(SimHost::new(&SimLayout {
            tracks: 2,
            devices_per_track: 1,
            parameters_per_device: 2,
            project: "Bridge".into(),
        }));
        let mut config = BridgeConfig::default();
        config.calibration.settle_ms = 1;
        config.calibration.unmute_after_ticks = 2;
        let (bridge, scheduler) = Bridge::new(host.clone(), &config).unwrap();
        (host, bridge, scheduler)
    }

    fn first_parameter(host: &SimHost) -> Arc<crate::host::sim::SimCapability> {
        let track = host.sim_tracks()[0].id();
        let device = host.sim_devices(track)[0].id();
        host.sim_parameters(device)[0].clone()
    }

    #[tokio::test]
    async fn test_registration_sequence() {
        let (host, bridge, mut scheduler) = setup();
        let consumer = Arc::new(RecordingConsumer::default());

        assert!(!host.has_midi_callbacks());
        bridge.register_consumer(consumer.clone()).await;
        assert!(bridge.is_registered());
        assert!(host.has_midi_callbacks());

        scheduler.tick().await;
        assert_eq!(
            consumer.calls(),
            vec![Call::Start, Call::ProjectLoad, Call::Callback(vec![])]
        );

        assert!(bridge.unregister_consumer().await);
        assert_eq!(consumer.calls().last(), Some(&Call::Stop));
        assert!(!host.has_midi_callbacks());
        assert!(!bridge.unregister_consumer().await);
    }

    #[tokio::test]
    async fn test_detached_consumer_leaves_nothing_for_the_next() {
        let (host, bridge, mut scheduler) = setup();
        let first = Arc::new(RecordingConsumer::default());
        let first_handle: Arc<dyn Consumer> = first.clone();
        bridge.register_consumer(first_handle.clone()).await;

        let track = host.sim_tracks()[0].clone();
        let runs = Arc::new(Mutex::new(0u32));
        {
            let runs = runs.clone();
            bridge
                .add_listener(
                    7,
                    track.id(),
                    "mute",
                    1,
                    Arc::new(move || {
                        *runs.lock() += 1;
                        Ok(())
                    }),
                )
                .unwrap();
        }

        // Queued for the first consumer, which goes away before the next tick
        track.set("mute", json!(true)).unwrap();
        assert!(host.inject_midi(RawEvent::new(0x90, 60, 100)));

        assert!(bridge.detach_consumer(&first_handle));
        assert!(!bridge.detach_consumer(&first_handle));
        assert!(!host.has_midi_callbacks());
        assert!(!host.inject_midi(RawEvent::new(0x80, 60, 0)));

        track.set("mute", json!(false)).unwrap();
        for _ in 0..50 {
            scheduler.tick().await;
        }

        let second = Arc::new(RecordingConsumer::default());
        bridge.register_consumer(second.clone()).await;
        scheduler.tick().await;
        assert_eq!(second.batches(), vec![vec![]]);
        assert_eq!(*runs.lock(), 0);

        // The departed session's subscriptions are gone for good
        assert_eq!(bridge.drop_listeners(7), 1);
        assert_eq!(bridge.drop_listeners(7), 0);
        track.set("mute", json!(true)).unwrap();
        host.inject_midi(RawEvent::new(0x90, 62, 90));
        scheduler.tick().await;
        assert_eq!(*runs.lock(), 0);
        assert_eq!(second.batches()[1], vec![RawEvent::new(0x90, 62, 90)]);
        assert!(first.batches().is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_drops_work_queued_for_the_previous_consumer() {
        let (host, bridge, mut scheduler) = setup();
        let first = Arc::new(RecordingConsumer::default());
        bridge.register_consumer(first.clone()).await;
        host.inject_midi(RawEvent::new(0x90, 60, 100));

        let second = Arc::new(RecordingConsumer::default());
        bridge.register_consumer(second.clone()).await;
        assert_eq!(first.calls().last(), Some(&Call::Stop));
        assert!(host.has_midi_callbacks());

        scheduler.tick().await;
        assert_eq!(second.batches(), vec![vec![]]);
        assert!(first.batches().is_empty());
    }

    #[tokio::test]
    async fn test_listener_runs_before_delivery_and_mutations_land_next_tick() {
        let (host, bridge, mut scheduler) = setup();
        let consumer = Arc::new(RecordingConsumer::default());
        bridge.register_consumer(consumer.clone()).await;

        let track = host.sim_tracks()[0].clone();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            let track = track.clone();
            bridge
                .add_listener(
                    1,
                    track.id(),
                    "mute",
                    1,
                    Arc::new(move || -> anyhow::Result<()> {
                        order.lock().push("listener");
                        // Mutating from inside a callback re-triggers the observer
                        let muted = track.get("mute")?.as_bool().unwrap_or(false);
                        if muted {
                            track.set("mute", json!(false))?;
                        }
                        Ok(())
                    }),
                )
                .unwrap();
        }

        track.set("mute", json!(true)).unwrap();
        scheduler.tick().await;
        assert_eq!(*order.lock(), vec!["listener"]);
        assert_eq!(scheduler.stats().callbacks_run, 1);

        // The un-mute from the callback is delivered on the following tick
        scheduler.tick().await;
        assert_eq!(*order.lock(), vec!["listener", "listener"]);
    }

    #[tokio::test]
    async fn test_add_listener_validates_target() {
        let (_host, bridge, _scheduler) = setup();
        let noop: ListenerCallback = Arc::new(|| Ok(()));

        assert!(matches!(
            bridge.add_listener(1, CapabilityId(4242), "mute", 1, noop.clone()),
            Err(BridgeError::UnknownCapability(_))
        ));

        let track = bridge.track_bank()[0].id;
        assert!(matches!(
            bridge.add_listener(1, track, "tempo", 1, noop.clone()),
            Err(BridgeError::Host(HostError::UnknownProperty { .. }))
        ));
        bridge.add_listener(1, track, "volume", 1, noop).unwrap();
        assert_eq!(bridge.remove_listener(track, "volume", 1), 1);
    }

    #[tokio::test]
    async fn test_two_note_threads_interleaved_with_a_third() {
        let (host, bridge, mut scheduler) = setup();
        let consumer = Arc::new(RecordingConsumer::default());
        bridge.register_consumer(consumer.clone()).await;

        // One producer per MIDI channel so each sub-order can be recovered
        let producers: Vec<Vec<RawEvent>> = vec![
            (0..100)
                .flat_map(|_| [RawEvent::new(0x90, 60, 100), RawEvent::new(0x80, 60, 0)])
                .collect(),
            (0..100u8)
                .flat_map(|n| [RawEvent::new(0x91, n, 100), RawEvent::new(0x81, n, 0)])
                .collect(),
            (0..200u8).map(|n| RawEvent::new(0xB2, 7, n % 128)).collect(),
        ];

        let handles: Vec<_> = producers
            .iter()
            .cloned()
            .map(|events| {
                let host = host.clone();
                thread::spawn(move || {
                    for event in events {
                        host.inject_midi(event);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        scheduler.tick().await;
        let batches = consumer.batches();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 600);

        for (channel, expected) in producers.iter().enumerate() {
            let seen: Vec<RawEvent> = batch
                .iter()
                .filter(|e| usize::from(e.status & 0x0F) == channel)
                .copied()
                .collect();
            assert_eq!(&seen, expected);
        }

        // Nothing is delivered twice
        scheduler.tick().await;
        assert!(consumer.batches()[1].is_empty());
    }

    #[tokio::test]
    async fn test_midi_before_registration_is_not_queued() {
        let (host, bridge, mut scheduler) = setup();
        assert!(!host.inject_midi(RawEvent::new(0x90, 60, 100)));

        let consumer = Arc::new(RecordingConsumer::default());
        bridge.register_consumer(consumer.clone()).await;
        scheduler.tick().await;
        assert_eq!(consumer.batches(), vec![vec![]]);
    }

    #[tokio::test]
    async fn test_mmc_sysex_drives_transport() {
        let (host, bridge, _scheduler) = setup();
        bridge
            .register_consumer(Arc::new(RecordingConsumer::default()))
            .await;

        host.inject_sysex(&[0xF0, 0x7F, 0x7F, 0x06, 0x02, 0xF7]);
        let transport = bridge.transport_info().id;
        assert_eq!(bridge.get_value(transport, "playing").unwrap(), json!(true));

        host.inject_sysex(&[0xF0, 0x7F, 0x7F, 0x06, 0x01, 0xF7]);
        assert_eq!(bridge.get_value(transport, "playing").unwrap(), json!(false));

        // Unrelated SysEx is ignored
        host.inject_sysex(&[0xF0, 0x00, 0x20, 0x32, 0xF7]);
        assert_eq!(host.sim_transport().invoked(), vec!["play", "stop"]);
    }

    #[tokio::test]
    async fn test_project_reload_delivered_before_batch() {
        let (host, bridge, mut scheduler) = setup();
        let consumer = Arc::new(RecordingConsumer::default());

        // A project change before registration is covered by registration itself
        host.load_project("Early");
        bridge.register_consumer(consumer.clone()).await;
        scheduler.tick().await;
        assert_eq!(
            consumer.calls(),
            vec![Call::Start, Call::ProjectLoad, Call::Callback(vec![])]
        );

        host.load_project("Second");
        host.inject_midi(RawEvent::new(0x80, 1, 0));
        scheduler.tick().await;

        let calls = consumer.calls();
        assert_eq!(
            calls[3..],
            [
                Call::ProjectLoad,
                Call::Callback(vec![RawEvent::new(0x80, 1, 0)])
            ]
        );
        assert_eq!(scheduler.stats().project_loads, 1);
    }

    #[tokio::test]
    async fn test_banks_and_accessors() {
        let (host, bridge, _scheduler) = setup();

        let tracks = bridge.track_bank();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].name, "Track 1");

        let devices = bridge.device_bank(tracks[1].id).unwrap();
        let params = bridge.parameter_bank(devices[0].id).unwrap();
        assert_eq!(params.len(), 2);

        bridge.set_value(params[0].id, "value", json!(0.75)).unwrap();
        assert_eq!(bridge.get_value(params[0].id, "value").unwrap(), json!(0.75));
        assert_eq!(bridge.get_raw(params[0].id, "value").unwrap(), 0.75);

        assert!(matches!(
            bridge.device_bank(CapabilityId(1_000_000)),
            Err(BridgeError::UnknownCapability(_))
        ));
        assert!(matches!(
            bridge.invoke(tracks[0].id, "play"),
            Err(BridgeError::Host(HostError::UnsupportedAction { .. }))
        ));

        bridge.log("hello from script");
        bridge.notify("Heads up");
        assert_eq!(
            host.log_lines(),
            vec![LogLine::Info("hello from script".into())]
        );
        assert_eq!(host.notifications(), vec!["Heads up"]);
    }

    #[tokio::test]
    async fn test_mute_window_expires_without_a_consumer() {
        let (host, bridge, mut scheduler) = setup();
        let param = first_parameter(&host);

        bridge.parameter_range(param.id()).await.unwrap();
        assert_eq!(host.mute_history(), vec![true]);
        assert!(!bridge.is_registered());

        for _ in 0..3 {
            scheduler.tick().await;
        }
        assert_eq!(host.mute_history(), vec![true, false]);
        assert_eq!(scheduler.stats().deliveries, 0);
    }

    #[tokio::test]
    async fn test_parameter_range_notifies_listener_once() {
        let (host, bridge, mut scheduler) = setup();
        let consumer = Arc::new(RecordingConsumer::default());
        bridge.register_consumer(consumer.clone()).await;

        let param = first_parameter(&host);
        param.set_raw_range(-48.0, 6.0);
        let fired = Arc::new(Mutex::new(0u32));
        {
            let fired = fired.clone();
            bridge
                .add_listener(
                    1,
                    param.id(),
                    "value",
                    7,
                    Arc::new(move || {
                        *fired.lock() += 1;
                        Ok(())
                    }),
                )
                .unwrap();
        }

        let range = bridge.parameter_range(param.id()).await.unwrap();
        assert_eq!(range, ParameterRange { low: -48.0, high: 6.0 });

        scheduler.tick().await;
        assert_eq!(*fired.lock(), 1);

        // Mute window expires after the configured ticks
        scheduler.tick().await;
        scheduler.tick().await;
        assert_eq!(host.mute_history(), vec![true, false]);

        let track = bridge.track_bank()[0].id;
        assert!(bridge.parameter_range(track).await.is_err());
    }
}
