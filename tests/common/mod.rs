//! In-memory collaborator implementations for engine tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use natter_voice::device::{DeviceDescriptor, DeviceEnumerator, DeviceKind};
use natter_voice::error::MediaError;
use natter_voice::media::{AudioCapture, CaptureBackend, CaptureStop, ScreenCapture, VideoCapture};
use natter_voice::quality::VideoConstraints;
use natter_voice::signaling::bus::{BusError, BusEvent, InboundSignal, SignalingBus};
use natter_voice::signaling::message::SignalPayload;
use natter_voice::transport::{
    AudioFrame, ConnectionEvent, MediaConnection, MediaTransport, TrackHandle, TrackKind,
    TrackSlot, TrackSource, TransportError, TransportStats,
};

// ── Concurrency gauge ──────────────────────────────────────

/// Tracks how many offer creations overlap, and the high-water mark.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicU32,
    max: AtomicU32,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_seen(&self) -> u32 {
        self.max.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.current.store(0, Ordering::SeqCst);
        self.max.store(0, Ordering::SeqCst);
    }
}

// ── Mock media transport ───────────────────────────────────

pub struct MockConnection {
    pub remote: Uuid,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    pub offers: AtomicU32,
    pub answers: AtomicU32,
    pub added_tracks: Mutex<Vec<TrackHandle>>,
    pub replaced_tracks: Mutex<Vec<(TrackSlot, TrackHandle)>>,
    pub removed_tracks: Mutex<Vec<TrackSlot>>,
    pub stable: AtomicBool,
    pub stats: Mutex<TransportStats>,
    pub closed: AtomicBool,
    offer_delay: Duration,
    gauge: Arc<ConcurrencyGauge>,
}

impl MockConnection {
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn emit_connected(&self) {
        self.emit(ConnectionEvent::Connected);
    }

    pub fn emit_error(&self, message: &str) {
        self.emit(ConnectionEvent::Error(message.to_string()));
    }

    pub fn set_stats(&self, loss_permille: u64, jitter_seconds: f64) {
        *self.stats.lock().unwrap() = TransportStats {
            packets_received: 1_000 - loss_permille,
            packets_lost: loss_permille,
            jitter_seconds,
        };
    }

    pub fn offer_count(&self) -> u32 {
        self.offers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConnection for MockConnection {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.gauge.enter();
        if !self.offer_delay.is_zero() {
            tokio::time::sleep(self.offer_delay).await;
        }
        self.gauge.exit();
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("offer-{}-{n}", self.remote))
    }

    async fn create_answer(&self, _offer_sdp: &str) -> Result<String, TransportError> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("answer-{}-{n}", self.remote))
    }

    async fn apply_answer(&self, _sdp: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn add_track(&self, track: TrackHandle) -> Result<(), TransportError> {
        self.added_tracks.lock().unwrap().push(track);
        Ok(())
    }

    async fn replace_track(
        &self,
        slot: TrackSlot,
        track: TrackHandle,
    ) -> Result<(), TransportError> {
        self.replaced_tracks.lock().unwrap().push((slot, track));
        Ok(())
    }

    async fn remove_track(&self, slot: TrackSlot) -> Result<(), TransportError> {
        self.removed_tracks.lock().unwrap().push(slot);
        Ok(())
    }

    async fn is_stable(&self) -> bool {
        self.stable.load(Ordering::SeqCst)
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        Ok(*self.stats.lock().unwrap())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockTransport {
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
    /// Emit `Connected` as soon as a connection is created.
    pub auto_connect: AtomicBool,
    pub offer_delay: Mutex<Duration>,
    pub gauge: Arc<ConcurrencyGauge>,
}

impl MockTransport {
    pub fn new(auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Vec::new()),
            auto_connect: AtomicBool::new(auto_connect),
            offer_delay: Mutex::new(Duration::ZERO),
            gauge: Arc::new(ConcurrencyGauge::default()),
        })
    }

    pub fn set_offer_delay(&self, delay: Duration) {
        *self.offer_delay.lock().unwrap() = delay;
    }

    /// Most recent connection created for a user.
    pub fn latest_for(&self, remote: Uuid) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.remote == remote)
            .cloned()
    }

    pub fn created_for(&self, remote: Uuid) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.remote == remote)
            .count()
    }

    pub fn all(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().unwrap().clone()
    }
}

impl MediaTransport for MockTransport {
    fn create_connection(
        &self,
        remote_user: Uuid,
    ) -> Result<
        (
            Arc<dyn MediaConnection>,
            mpsc::UnboundedReceiver<ConnectionEvent>,
        ),
        TransportError,
    > {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(MockConnection {
            remote: remote_user,
            events_tx: tx.clone(),
            offers: AtomicU32::new(0),
            answers: AtomicU32::new(0),
            added_tracks: Mutex::new(Vec::new()),
            replaced_tracks: Mutex::new(Vec::new()),
            removed_tracks: Mutex::new(Vec::new()),
            stable: AtomicBool::new(true),
            stats: Mutex::new(TransportStats::default()),
            closed: AtomicBool::new(false),
            offer_delay: *self.offer_delay.lock().unwrap(),
            gauge: Arc::clone(&self.gauge),
        });
        if self.auto_connect.load(Ordering::SeqCst) {
            let _ = tx.send(ConnectionEvent::Connected);
        }
        self.connections.lock().unwrap().push(Arc::clone(&conn));
        Ok((conn, rx))
    }
}

// ── Mock signaling bus ─────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SentSignal {
    pub room_id: Uuid,
    pub target: Option<Uuid>,
    pub payload: SignalPayload,
}

#[derive(Default)]
pub struct MockBus {
    pub sent: Mutex<Vec<SentSignal>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BusEvent>>>,
    pub fail_sends: AtomicBool,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a message to the engine as if a peer had sent it.
    pub fn inject(&self, room_id: Uuid, from: Uuid, payload: SignalPayload) {
        let event = BusEvent::Message(InboundSignal {
            room_id,
            from,
            payload,
        });
        for tx in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(event.clone());
        }
    }

    pub fn reconnect(&self) {
        for tx in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(BusEvent::Reconnected);
        }
    }

    pub fn sent_of_kind(&self, kind: &str) -> Vec<SentSignal> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.payload.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl SignalingBus for MockBus {
    async fn send(
        &self,
        room_id: Uuid,
        target: Option<Uuid>,
        payload: SignalPayload,
    ) -> Result<(), BusError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("bus down".into()));
        }
        self.sent.lock().unwrap().push(SentSignal {
            room_id,
            target,
            payload,
        });
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

// ── Fake capture backend ───────────────────────────────────

#[derive(Default)]
pub struct FakeCapture {
    mic_tx: Mutex<Option<mpsc::UnboundedSender<AudioFrame>>>,
    pub fail_audio: Mutex<Option<MediaError>>,
}

impl FakeCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push a raw capture frame into the live microphone stream.
    pub fn push_mic_frame(&self, data: Vec<i16>) {
        if let Some(tx) = self.mic_tx.lock().unwrap().as_ref() {
            let _ = tx.send(AudioFrame {
                data,
                sample_rate: 48_000,
                num_channels: 1,
            });
        }
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn open_audio(&self, device_id: Option<&str>) -> Result<AudioCapture, MediaError> {
        if let Some(error) = self.fail_audio.lock().unwrap().take() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.mic_tx.lock().unwrap() = Some(tx);
        Ok(AudioCapture {
            device_id: device_id.map(str::to_string),
            track: TrackHandle::new(
                format!("mic-{}", device_id.unwrap_or("default")),
                TrackKind::Audio,
                TrackSource::Microphone,
            ),
            frames: rx,
            stop: CaptureStop::noop(),
        })
    }

    async fn open_camera(
        &self,
        device_id: Option<&str>,
        _constraints: &VideoConstraints,
    ) -> Result<VideoCapture, MediaError> {
        Ok(VideoCapture {
            device_id: device_id.map(str::to_string),
            track: TrackHandle::new("camera-0", TrackKind::Video, TrackSource::Camera),
            stop: CaptureStop::noop(),
        })
    }

    async fn open_screen(&self, capture_audio: bool) -> Result<ScreenCapture, MediaError> {
        Ok(ScreenCapture {
            video_track: TrackHandle::new("screen-0", TrackKind::Video, TrackSource::Screen),
            audio_track: capture_audio.then(|| {
                TrackHandle::new("screen-audio-0", TrackKind::Audio, TrackSource::ScreenAudio)
            }),
            stop: CaptureStop::noop(),
        })
    }

    async fn apply_video_constraints(
        &self,
        _constraints: &VideoConstraints,
    ) -> Result<(), MediaError> {
        Ok(())
    }
}

// ── Fake device enumerator ─────────────────────────────────

pub struct FakeEnumerator;

impl FakeEnumerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl DeviceEnumerator for FakeEnumerator {
    fn list(&self) -> Result<Vec<DeviceDescriptor>, MediaError> {
        Ok(vec![
            DeviceDescriptor {
                id: "builtin-mic".into(),
                human_label: "Built-in Microphone".into(),
                group_id: None,
                kind: DeviceKind::AudioInput,
                is_default: true,
                is_preferred: false,
                last_test_result: None,
            },
            DeviceDescriptor {
                id: "builtin-speakers".into(),
                human_label: "Built-in Speakers".into(),
                group_id: None,
                kind: DeviceKind::AudioOutput,
                is_default: true,
                is_preferred: false,
                last_test_result: None,
            },
        ])
    }

    fn request_permission(&self, _kind: DeviceKind) -> Result<(), MediaError> {
        Ok(())
    }

    fn change_events(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        None
    }
}

// ── Logging ────────────────────────────────────────────────

/// Route engine logs to stderr for failing-test forensics. Safe to call
/// from every test; repeat initialization is ignored.
pub fn init_logging() {
    let _ = simplelog::SimpleLogger::init(
        log::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

// ── Scheduling helper ──────────────────────────────────────

/// Let spawned tasks run to quiescence without advancing time.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Advance paused time and let timer-driven work run.
pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}
