//! cpal-backed device enumeration and audio I/O (feature `native-audio`).
//!
//! The engine core never talks to hardware; this adapter implements the
//! enumeration trait and provides the stream builders that bridge the
//! engine's rtrb rings to the platform's audio callbacks.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rtrb::{Consumer, Producer};
use tokio::sync::mpsc;

use crate::error::MediaError;

use super::{DeviceDescriptor, DeviceEnumerator, DeviceKind};

const SAMPLE_RATE: u32 = 48_000;

pub struct CpalEnumerator;

impl DeviceEnumerator for CpalEnumerator {
    fn list(&self) -> Result<Vec<DeviceDescriptor>, MediaError> {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let mut devices = Vec::new();

        let inputs = host
            .input_devices()
            .map_err(|e| MediaError::DeviceNotFound(e.to_string()))?;
        for device in inputs {
            if let Ok(name) = device.name() {
                devices.push(descriptor(
                    name.clone(),
                    DeviceKind::AudioInput,
                    default_input.as_deref() == Some(&name),
                ));
            }
        }

        let outputs = host
            .output_devices()
            .map_err(|e| MediaError::DeviceNotFound(e.to_string()))?;
        for device in outputs {
            if let Ok(name) = device.name() {
                devices.push(descriptor(
                    name.clone(),
                    DeviceKind::AudioOutput,
                    default_output.as_deref() == Some(&name),
                ));
            }
        }

        Ok(devices)
    }

    fn request_permission(&self, _kind: DeviceKind) -> Result<(), MediaError> {
        // Desktop hosts grant capture access at the OS level; opening the
        // stream is the permission check.
        Ok(())
    }

    fn change_events(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        // cpal has no hot-plug notification stream; the registry polls.
        None
    }
}

fn descriptor(name: String, kind: DeviceKind, is_default: bool) -> DeviceDescriptor {
    DeviceDescriptor {
        id: name.clone(),
        human_label: name,
        group_id: None,
        kind,
        is_default,
        is_preferred: false,
        last_test_result: None,
    }
}

fn find_input(device_id: Option<&str>) -> Result<cpal::Device, MediaError> {
    let host = cpal::default_host();
    match device_id {
        None => host
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceNotFound("no input device".into())),
        Some(id) => host
            .input_devices()
            .map_err(|e| MediaError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| MediaError::DeviceNotFound(id.to_string())),
    }
}

fn find_output(device_id: Option<&str>) -> Result<cpal::Device, MediaError> {
    let host = cpal::default_host();
    match device_id {
        None => host
            .default_output_device()
            .ok_or_else(|| MediaError::DeviceNotFound("no output device".into())),
        Some(id) => host
            .output_devices()
            .map_err(|e| MediaError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| MediaError::DeviceNotFound(id.to_string())),
    }
}

/// Mono 48 kHz capture stream pushing PCM into an rtrb ring buffer.
/// Samples are dropped, not blocked on, when the ring is full.
pub fn build_input_stream(
    device_id: Option<&str>,
    mut producer: Producer<i16>,
) -> Result<cpal::Stream, MediaError> {
    let device = find_input(device_id)?;
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    let _ = producer.push(sample);
                }
            },
            |err| log::error!("cpal input error: {err}"),
            None,
        )
        .map_err(|e| MediaError::DeviceBusy(e.to_string()))?;

    stream
        .play()
        .map_err(|e| MediaError::DeviceBusy(e.to_string()))?;
    Ok(stream)
}

/// Stereo 48 kHz playback stream popping mixed PCM from an rtrb ring buffer.
pub fn build_output_stream(
    device_id: Option<&str>,
    mut consumer: Consumer<i16>,
) -> Result<cpal::Stream, MediaError> {
    let device = find_output(device_id)?;
    let config = cpal::StreamConfig {
        channels: 2,
        sample_rate: SAMPLE_RATE,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                for sample in data.iter_mut() {
                    *sample = consumer.pop().unwrap_or(0);
                }
            },
            |err| log::error!("cpal output error: {err}"),
            None,
        )
        .map_err(|e| MediaError::DeviceBusy(e.to_string()))?;

    stream
        .play()
        .map_err(|e| MediaError::DeviceBusy(e.to_string()))?;
    Ok(stream)
}
