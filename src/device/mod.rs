//! Device registry: enumeration, hot-plug tracking, and fallback selection.
//!
//! The registry caches the enumerator's view of the world, overlays
//! user-preferred flags and test results, and watches for hot-plug changes —
//! event-driven where the platform supports it (throttled so a USB headset
//! that flaps doesn't spam the app), polled otherwise.

mod enumerator;
#[cfg(feature = "native-audio")]
pub mod native;

pub use enumerator::DeviceEnumerator;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::DeviceConfig;
use crate::error::MediaError;
use crate::events::{EngineEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceTestOutcome {
    Passed,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub human_label: String,
    /// Groups the jacks of one physical device, where the platform reports it.
    pub group_id: Option<String>,
    pub kind: DeviceKind,
    /// Platform-reported default for its kind.
    pub is_default: bool,
    /// User-set, persisted by the app layer.
    pub is_preferred: bool,
    pub last_test_result: Option<DeviceTestOutcome>,
}

#[derive(Default)]
struct RegistryInner {
    devices: Vec<DeviceDescriptor>,
    preferred: HashMap<DeviceKind, String>,
    test_results: HashMap<String, DeviceTestOutcome>,
}

impl RegistryInner {
    fn overlay(&self, mut device: DeviceDescriptor) -> DeviceDescriptor {
        device.is_preferred = self.preferred.get(&device.kind) == Some(&device.id);
        device.last_test_result = self.test_results.get(&device.id).cloned();
        device
    }
}

pub struct DeviceRegistry {
    enumerator: Arc<dyn DeviceEnumerator>,
    inner: Arc<Mutex<RegistryInner>>,
    events: EventBus,
    config: DeviceConfig,
    watch_shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl DeviceRegistry {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        config: DeviceConfig,
        events: EventBus,
    ) -> Self {
        let mut preferred = HashMap::new();
        if let Some(id) = config.preferred_input.clone() {
            preferred.insert(DeviceKind::AudioInput, id);
        }
        if let Some(id) = config.preferred_output.clone() {
            preferred.insert(DeviceKind::AudioOutput, id);
        }
        if let Some(id) = config.preferred_camera.clone() {
            preferred.insert(DeviceKind::VideoInput, id);
        }

        Self {
            enumerator,
            inner: Arc::new(Mutex::new(RegistryInner {
                preferred,
                ..Default::default()
            })),
            events,
            config,
            watch_shutdown: Mutex::new(None),
        }
    }

    /// Re-enumerate. Returns true when the device set changed.
    pub fn refresh(&self) -> Result<bool, MediaError> {
        let listed = self.enumerator.list()?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let fresh: Vec<DeviceDescriptor> =
            listed.into_iter().map(|d| inner.overlay(d)).collect();
        let changed = fresh != inner.devices;
        inner.devices = fresh;
        Ok(changed)
    }

    pub fn devices(&self, kind: DeviceKind) -> Vec<DeviceDescriptor> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }

    pub fn request_permission(&self, kind: DeviceKind) -> Result<(), MediaError> {
        self.enumerator.request_permission(kind)
    }

    pub fn set_preferred(&self, kind: DeviceKind, id: Option<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match id {
            Some(id) => {
                inner.preferred.insert(kind, id);
            }
            None => {
                inner.preferred.remove(&kind);
            }
        }
        let overlaid: Vec<DeviceDescriptor> = inner
            .devices
            .clone()
            .into_iter()
            .map(|d| inner.overlay(d))
            .collect();
        inner.devices = overlaid;
    }

    /// Best alternative for a kind: preferred, then platform default, then
    /// first available.
    pub fn best(&self, kind: DeviceKind) -> Option<DeviceDescriptor> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let of_kind = || inner.devices.iter().filter(|d| d.kind == kind);

        of_kind()
            .find(|d| d.is_preferred)
            .or_else(|| of_kind().find(|d| d.is_default))
            .or_else(|| of_kind().next())
            .cloned()
    }

    pub fn record_test_result(&self, id: &str, outcome: DeviceTestOutcome) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.test_results.insert(id.to_string(), outcome.clone());
        if let Some(device) = inner.devices.iter_mut().find(|d| d.id == id) {
            device.last_test_result = Some(outcome);
        }
    }

    /// Start the hot-plug watcher. Idempotent; a second call replaces the
    /// previous watcher.
    pub fn start_watching(&self) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self
            .watch_shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let enumerator = Arc::clone(&self.enumerator);
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let throttle = Duration::from_millis(self.config.change_throttle_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        match self.enumerator.change_events() {
            Some(mut change_rx) => {
                tokio::spawn(async move {
                    let mut last_emit: Option<Instant> = None;
                    loop {
                        tokio::select! {
                            notification = change_rx.recv() => {
                                if notification.is_none() {
                                    log::warn!("device watcher: change stream closed");
                                    break;
                                }
                                // Throttle: wait out the remainder of the
                                // window, then treat everything queued up as
                                // one change.
                                if let Some(at) = last_emit {
                                    let elapsed = at.elapsed();
                                    if elapsed < throttle {
                                        tokio::time::sleep(throttle - elapsed).await;
                                    }
                                }
                                while change_rx.try_recv().is_ok() {}
                                Self::refresh_shared(&enumerator, &inner);
                                events.emit(EngineEvent::DevicesChanged);
                                last_emit = Some(Instant::now());
                            }
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(poll);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    // The first tick fires immediately; skip it so a fresh
                    // registry doesn't report its initial listing as a change.
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if Self::refresh_shared(&enumerator, &inner) {
                                    events.emit(EngineEvent::DevicesChanged);
                                }
                            }
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                });
            }
        }
    }

    pub fn stop_watching(&self) {
        self.watch_shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn refresh_shared(
        enumerator: &Arc<dyn DeviceEnumerator>,
        inner: &Arc<Mutex<RegistryInner>>,
    ) -> bool {
        let listed = match enumerator.list() {
            Ok(listed) => listed,
            Err(e) => {
                log::warn!("device watcher: enumeration failed: {e}");
                return false;
            }
        };
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        let fresh: Vec<DeviceDescriptor> =
            listed.into_iter().map(|d| inner.overlay(d)).collect();
        let changed = fresh != inner.devices;
        inner.devices = fresh;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeEnumerator {
        devices: Mutex<Vec<DeviceDescriptor>>,
        change_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
        eventful: bool,
    }

    impl FakeEnumerator {
        fn new(eventful: bool) -> Arc<Self> {
            Arc::new(Self {
                devices: Mutex::new(vec![
                    mic("headset-mic", false),
                    mic("builtin-mic", true),
                ]),
                change_tx: Mutex::new(None),
                eventful,
            })
        }

        fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
            *self.devices.lock().unwrap() = devices;
        }

        fn notify(&self) {
            if let Some(tx) = self.change_tx.lock().unwrap().as_ref() {
                let _ = tx.send(());
            }
        }
    }

    impl DeviceEnumerator for FakeEnumerator {
        fn list(&self) -> Result<Vec<DeviceDescriptor>, MediaError> {
            Ok(self.devices.lock().unwrap().clone())
        }

        fn request_permission(&self, _kind: DeviceKind) -> Result<(), MediaError> {
            Ok(())
        }

        fn change_events(&self) -> Option<mpsc::UnboundedReceiver<()>> {
            if !self.eventful {
                return None;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.change_tx.lock().unwrap() = Some(tx);
            Some(rx)
        }
    }

    fn mic(id: &str, is_default: bool) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.into(),
            human_label: id.into(),
            group_id: None,
            kind: DeviceKind::AudioInput,
            is_default,
            is_preferred: false,
            last_test_result: None,
        }
    }

    fn registry(enumerator: Arc<FakeEnumerator>) -> DeviceRegistry {
        DeviceRegistry::new(enumerator, DeviceConfig::default(), EventBus::new())
    }

    #[test]
    fn best_prefers_preferred_then_default_then_first() {
        let enumerator = FakeEnumerator::new(false);
        let reg = registry(enumerator.clone());
        reg.refresh().unwrap();

        // Default wins when nothing is preferred.
        assert_eq!(reg.best(DeviceKind::AudioInput).unwrap().id, "builtin-mic");

        reg.set_preferred(DeviceKind::AudioInput, Some("headset-mic".into()));
        assert_eq!(reg.best(DeviceKind::AudioInput).unwrap().id, "headset-mic");

        // Preferred device unplugged: fall back to the default.
        enumerator.set_devices(vec![mic("builtin-mic", true)]);
        reg.refresh().unwrap();
        assert_eq!(reg.best(DeviceKind::AudioInput).unwrap().id, "builtin-mic");

        // No default either: first available.
        enumerator.set_devices(vec![mic("usb-mic", false)]);
        reg.refresh().unwrap();
        assert_eq!(reg.best(DeviceKind::AudioInput).unwrap().id, "usb-mic");
    }

    #[test]
    fn test_results_survive_refresh() {
        let enumerator = FakeEnumerator::new(false);
        let reg = registry(enumerator);
        reg.refresh().unwrap();

        reg.record_test_result("headset-mic", DeviceTestOutcome::Passed);
        reg.refresh().unwrap();

        let devices = reg.devices(DeviceKind::AudioInput);
        let headset = devices.iter().find(|d| d.id == "headset-mic").unwrap();
        assert_eq!(headset.last_test_result, Some(DeviceTestOutcome::Passed));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_watcher_reports_hotplug() {
        let enumerator = FakeEnumerator::new(false);
        let events = EventBus::new();
        let (_sub, mut rx) = events.subscribe();
        let reg = DeviceRegistry::new(
            enumerator.clone(),
            DeviceConfig::default(),
            events,
        );
        reg.refresh().unwrap();
        reg.start_watching();

        // Nothing changed: two poll intervals, no event.
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert!(rx.try_recv().is_err());

        enumerator.set_devices(vec![mic("builtin-mic", true)]);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::DevicesChanged)));

        reg.stop_watching();
    }

    #[tokio::test(start_paused = true)]
    async fn eventful_watcher_throttles_notification_bursts() {
        let enumerator = FakeEnumerator::new(true);
        let events = EventBus::new();
        let (_sub, mut rx) = events.subscribe();
        let reg = DeviceRegistry::new(
            enumerator.clone(),
            DeviceConfig::default(),
            events,
        );
        reg.start_watching();
        tokio::task::yield_now().await;

        // A burst of notifications inside the throttle window collapses to
        // two emitted changes: the leading edge and one trailing refresh.
        for _ in 0..5 {
            enumerator.notify();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert!(seen <= 2, "expected throttled notifications, saw {seen}");

        reg.stop_watching();
    }
}
