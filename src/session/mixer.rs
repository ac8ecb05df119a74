//! Remote audio mixing.
//!
//! One task pulls decoded frames from every peer's stream on a 10ms tick,
//! applies the per-user gain, and pushes the stereo mix into a lock-free
//! ring buffer feeding the playback device. Deafened output is silence.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use rtrb::Producer;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::transport::AudioFrame;

const TICK_MS: u64 = 10;
/// Stereo 10ms at 48kHz.
const MIX_SAMPLES: usize = 960;

/// Effective playback gain for one peer. Inputs are clamped before
/// multiplying; the final sample values are clamped to the i16 range when
/// mixed.
pub fn effective_gain(local: f32, master: f32, attenuation_percent: f32) -> f32 {
    let local = local.clamp(0.0, 2.0);
    let master = master.clamp(0.0, 2.0);
    let attenuation = 1.0 - attenuation_percent.clamp(0.0, 100.0) / 100.0;
    local * master * attenuation
}

struct GainTable {
    user_volume: HashMap<Uuid, f32>,
    user_muted: HashSet<Uuid>,
    master: f32,
    attenuation_percent: f32,
}

impl Default for GainTable {
    fn default() -> Self {
        Self {
            user_volume: HashMap::new(),
            user_muted: HashSet::new(),
            master: 1.0,
            attenuation_percent: 0.0,
        }
    }
}

#[derive(Clone, Default)]
pub struct AudioMixer {
    streams: Arc<Mutex<HashMap<Uuid, mpsc::UnboundedReceiver<AudioFrame>>>>,
    gains: Arc<Mutex<GainTable>>,
    deaf: Arc<AtomicBool>,
    shutdown_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl AudioMixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream(&self, user_id: Uuid, stream: mpsc::UnboundedReceiver<AudioFrame>) {
        self.lock_streams().insert(user_id, stream);
    }

    /// Drop a peer's stream but keep their gain settings (the session may
    /// be mid-retry and come back).
    pub fn remove_stream(&self, user_id: Uuid) {
        self.lock_streams().remove(&user_id);
    }

    /// Forget a peer entirely: stream and gain settings.
    pub fn remove_user(&self, user_id: Uuid) {
        self.lock_streams().remove(&user_id);
        let mut gains = self.lock_gains();
        gains.user_volume.remove(&user_id);
        gains.user_muted.remove(&user_id);
    }

    pub fn set_user_volume(&self, user_id: Uuid, volume: f32) {
        self.lock_gains()
            .user_volume
            .insert(user_id, volume.clamp(0.0, 2.0));
    }

    pub fn set_user_muted(&self, user_id: Uuid, muted: bool) {
        let mut gains = self.lock_gains();
        if muted {
            gains.user_muted.insert(user_id);
        } else {
            gains.user_muted.remove(&user_id);
        }
    }

    pub fn set_master(&self, volume: f32) {
        self.lock_gains().master = volume.clamp(0.0, 2.0);
    }

    pub fn set_attenuation(&self, percent: f32) {
        self.lock_gains().attenuation_percent = percent.clamp(0.0, 100.0);
    }

    pub fn set_deaf(&self, deaf: bool) {
        self.deaf.store(deaf, Ordering::Relaxed);
    }

    /// Start the mix loop, writing into the playback ring buffer.
    pub fn start(&self, mut output: Producer<i16>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let streams = Arc::clone(&self.streams);
        let gains = Arc::clone(&self.gains);
        let deaf = Arc::clone(&self.deaf);

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(TICK_MS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut mix_buf = vec![0i32; MIX_SAMPLES];

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if deaf.load(Ordering::Relaxed) {
                            // Drain everything, play silence.
                            let mut streams = streams.lock().unwrap_or_else(|e| e.into_inner());
                            for stream in streams.values_mut() {
                                while stream.recv().now_or_never().flatten().is_some() {}
                            }
                            for _ in 0..MIX_SAMPLES {
                                let _ = output.push(0);
                            }
                            continue;
                        }

                        mix_buf.iter_mut().for_each(|s| *s = 0);
                        let mut has_audio = false;

                        {
                            let mut streams =
                                streams.lock().unwrap_or_else(|e| e.into_inner());
                            let gains = gains.lock().unwrap_or_else(|e| e.into_inner());

                            for (user_id, stream) in streams.iter_mut() {
                                let muted = gains.user_muted.contains(user_id);
                                let gain = effective_gain(
                                    gains.user_volume.get(user_id).copied().unwrap_or(1.0),
                                    gains.master,
                                    gains.attenuation_percent,
                                );

                                let mut offset = 0;
                                // Non-blocking poll: whatever frames arrived
                                // since the last tick get mixed now.
                                while let Some(frame) = stream.recv().now_or_never().flatten() {
                                    if muted {
                                        continue;
                                    }
                                    has_audio = true;
                                    offset = mix_frame_into(&mut mix_buf, &frame, gain, offset);
                                    if offset >= mix_buf.len() {
                                        // Excess frames this tick are dropped.
                                        break;
                                    }
                                }
                            }
                        }

                        if has_audio {
                            for &sample in &mix_buf {
                                let _ = output.push(sample.clamp(-32768, 32767) as i16);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn clear(&self) {
        self.lock_streams().clear();
        let mut gains = self.lock_gains();
        gains.user_volume.clear();
        gains.user_muted.clear();
    }

    fn lock_streams(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<Uuid, mpsc::UnboundedReceiver<AudioFrame>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_gains(&self) -> std::sync::MutexGuard<'_, GainTable> {
        self.gains.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Mix one mono or interleaved-stereo frame into the stereo buffer,
/// starting at `offset`. Returns the next write offset.
fn mix_frame_into(buf: &mut [i32], frame: &AudioFrame, gain: f32, offset: usize) -> usize {
    let mut out = offset;
    if frame.num_channels == 1 {
        for &sample in &frame.data {
            if out + 1 >= buf.len() {
                break;
            }
            let scaled = (f32::from(sample) * gain) as i32;
            buf[out] = buf[out].saturating_add(scaled);
            buf[out + 1] = buf[out + 1].saturating_add(scaled);
            out += 2;
        }
    } else {
        for &sample in &frame.data {
            if out >= buf.len() {
                break;
            }
            let scaled = (f32::from(sample) * gain) as i32;
            buf[out] = buf[out].saturating_add(scaled);
            out += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(samples: Vec<i16>) -> AudioFrame {
        AudioFrame {
            data: samples,
            sample_rate: 48_000,
            num_channels: 1,
        }
    }

    #[test]
    fn effective_gain_multiplies_and_clamps() {
        // The canonical example: 1.5 × 0.8 × (1 − 50/100) = 0.6.
        assert!((effective_gain(1.5, 0.8, 50.0) - 0.6).abs() < 1e-6);

        // Inputs clamp into range before multiplying.
        assert!((effective_gain(5.0, 1.0, 0.0) - 2.0).abs() < 1e-6);
        assert!((effective_gain(1.0, -1.0, 0.0) - 0.0).abs() < 1e-6);
        assert!((effective_gain(1.0, 1.0, 150.0) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn mono_frames_duplicate_into_both_channels() {
        let mut buf = vec![0i32; 8];
        let next = mix_frame_into(&mut buf, &mono(vec![100, -200]), 1.0, 0);
        assert_eq!(next, 4);
        assert_eq!(&buf[..4], &[100, 100, -200, -200]);
    }

    #[test]
    fn mixing_saturates_instead_of_wrapping() {
        let mut buf = vec![i32::MAX; 2];
        mix_frame_into(&mut buf, &mono(vec![i16::MAX]), 2.0, 0);
        assert_eq!(buf[0], i32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn mixer_applies_gain_and_deafen_silences() {
        let mixer = AudioMixer::new();
        let (producer, mut consumer) = rtrb::RingBuffer::<i16>::new(MIX_SAMPLES * 4);
        let user = Uuid::new_v4();

        let (tx, rx) = mpsc::unbounded_channel();
        mixer.add_stream(user, rx);
        mixer.set_user_volume(user, 1.5);
        mixer.set_master(0.8);
        mixer.set_attenuation(50.0);
        mixer.start(producer);

        tx.send(mono(vec![1000; 480])).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;

        // 1000 × 0.6 = 600 on both channels.
        let sample = consumer.pop().expect("mixed audio expected");
        assert_eq!(sample, 600);

        // Deafened: the next frame is swallowed and nothing but silence
        // would be produced.
        mixer.set_deaf(true);
        while consumer.pop().is_ok() {}
        tx.send(mono(vec![1000; 480])).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        let mut all_silent = true;
        while let Ok(sample) = consumer.pop() {
            if sample != 0 {
                all_silent = false;
            }
        }
        assert!(all_silent);

        mixer.stop();
    }
}
