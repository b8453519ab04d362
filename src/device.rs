//! # Audio Device Management
//!
//! Opens the microphone and the speaker for one voice session.
//!
//! ## Threading:
//! `cpal::Stream` is not `Send` on every platform, so each stream lives on a
//! dedicated thread for its whole life. The opening call blocks until that
//! thread reports whether the device came up, and the returned [`DeviceGuard`]
//! stops and joins the thread when dropped.
//!
//! ## Formats:
//! - **Capture**: whatever the device offers, shaped into mono blocks at the
//!   capture rate (see `audio::buffer::CaptureShaper`)
//! - **Playback**: the device rate is preferred at the playback rate; the mixer
//!   resamples when the device insists on something else
//!
//! Without the `device` feature every open fails with `CaptureError::Unavailable`.

use crate::audio::capture::BlockSink;
use crate::audio::codec::WireFormat;
use crate::audio::mixer::MixerOutput;
use crate::audio::playback::SourceId;
use crate::error::CaptureError;
use tokio::sync::mpsc;

/// Keeps an opened device alive; releases it on drop.
pub struct DeviceGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DeviceGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release now instead of waiting for drop.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Source of the two device contexts a session owns.
///
/// Both calls block while the device starts; callers on the async runtime
/// should go through `spawn_blocking`.
pub trait AudioBackend: Send + Sync + 'static {
    /// Start delivering `block_frames`-sample mono blocks at `format`'s rate into `sink`.
    fn open_capture(
        &self,
        device: Option<&str>,
        format: WireFormat,
        block_frames: usize,
        sink: BlockSink,
    ) -> Result<DeviceGuard, CaptureError>;

    /// Start an output device and return the clock/scheduling side of its mixer.
    fn open_playback(
        &self,
        device: Option<&str>,
        format: WireFormat,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<(MixerOutput, DeviceGuard), CaptureError>;
}

/// The host's real sound devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAudio;

#[cfg(not(feature = "device"))]
impl AudioBackend for SystemAudio {
    fn open_capture(
        &self,
        _device: Option<&str>,
        _format: WireFormat,
        _block_frames: usize,
        _sink: BlockSink,
    ) -> Result<DeviceGuard, CaptureError> {
        Err(CaptureError::Unavailable(
            "built without the `device` feature".to_string(),
        ))
    }

    fn open_playback(
        &self,
        _device: Option<&str>,
        _format: WireFormat,
        _completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<(MixerOutput, DeviceGuard), CaptureError> {
        Err(CaptureError::Unavailable(
            "built without the `device` feature".to_string(),
        ))
    }
}

#[cfg(feature = "device")]
impl AudioBackend for SystemAudio {
    fn open_capture(
        &self,
        device: Option<&str>,
        format: WireFormat,
        block_frames: usize,
        sink: BlockSink,
    ) -> Result<DeviceGuard, CaptureError> {
        host::spawn_stream("voice-capture", {
            let device = device.map(str::to_string);
            move || host::capture_stream(device.as_deref(), format, block_frames, sink).map(|s| (s, ()))
        })
        .map(|((), guard)| guard)
    }

    fn open_playback(
        &self,
        device: Option<&str>,
        format: WireFormat,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<(MixerOutput, DeviceGuard), CaptureError> {
        host::spawn_stream("voice-playback", {
            let device = device.map(str::to_string);
            move || host::playback_stream(device.as_deref(), format, completions)
        })
    }
}

#[cfg(feature = "device")]
mod host {
    use super::DeviceGuard;
    use crate::audio::buffer::CaptureShaper;
    use crate::audio::capture::BlockSink;
    use crate::audio::codec::{WireFormat, PCM16_SCALE};
    use crate::audio::mixer::{mixer, MixerOutput};
    use crate::audio::playback::SourceId;
    use crate::error::CaptureError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing::{debug, error, info};

    /// Run `build` on a fresh thread that keeps the resulting stream alive until
    /// the returned guard is dropped.
    pub(super) fn spawn_stream<T, F>(name: &str, build: F) -> Result<(T, DeviceGuard), CaptureError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<(Stream, T), CaptureError> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<T, CaptureError>>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, value)) => {
                        let _ = init_tx.send(Ok(value));
                        stream
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                while !stop_thread.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
            })
            .map_err(|e| CaptureError::Stream(format!("failed to spawn device thread: {}", e)))?;

        match init_rx.recv() {
            Ok(Ok(value)) => {
                let thread_name = name.to_string();
                let guard = DeviceGuard::new(move || {
                    stop.store(true, Ordering::Relaxed);
                    let _ = handle.join();
                    debug!("Released {}", thread_name);
                });
                Ok((value, guard))
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::Stream(format!("{} thread exited during init", name)))
            }
        }
    }

    fn find_device(
        devices: Result<impl Iterator<Item = cpal::Device>, cpal::DevicesError>,
        name: &str,
    ) -> Result<cpal::Device, CaptureError> {
        devices
            .map_err(|e| CaptureError::Stream(e.to_string()))?
            .find(|device| device.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceNotFound(name.to_string()))
    }

    fn is_supported(format: SampleFormat) -> bool {
        matches!(format, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16)
    }

    /// Prefer a config that runs natively at `rate`, else the device default.
    fn input_config(device: &cpal::Device, rate: u32) -> Result<(StreamConfig, SampleFormat), CaptureError> {
        let preferred = device.supported_input_configs().ok().and_then(|mut configs| {
            configs.find(|c| {
                c.min_sample_rate().0 <= rate && c.max_sample_rate().0 >= rate && is_supported(c.sample_format())
            })
        });
        if let Some(range) = preferred {
            let sample_format = range.sample_format();
            return Ok((range.with_sample_rate(SampleRate(rate)).config(), sample_format));
        }

        let default = device
            .default_input_config()
            .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?;
        Ok((default.config(), default.sample_format()))
    }

    fn output_config(device: &cpal::Device, rate: u32) -> Result<(StreamConfig, SampleFormat), CaptureError> {
        let preferred = device.supported_output_configs().ok().and_then(|mut configs| {
            configs.find(|c| {
                c.min_sample_rate().0 <= rate && c.max_sample_rate().0 >= rate && is_supported(c.sample_format())
            })
        });
        if let Some(range) = preferred {
            let sample_format = range.sample_format();
            return Ok((range.with_sample_rate(SampleRate(rate)).config(), sample_format));
        }

        let default = device
            .default_output_config()
            .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?;
        Ok((default.config(), default.sample_format()))
    }

    /// Feed one device callback through the shaper into the capture pipeline.
    fn shape(shaper: &mut CaptureShaper, sink: &BlockSink, samples: &[f32]) {
        let pushed = shaper.push(samples, |block| {
            sink.push_block(&block);
        });
        if let Err(e) = pushed {
            sink.fail(CaptureError::Stream(e.to_string()));
        }
    }

    pub(super) fn capture_stream(
        name: Option<&str>,
        format: WireFormat,
        block_frames: usize,
        sink: BlockSink,
    ) -> Result<Stream, CaptureError> {
        let host = cpal::default_host();
        let device = match name {
            Some(name) => find_device(host.input_devices(), name)?,
            None => host.default_input_device().ok_or(CaptureError::NoInputDevice)?,
        };
        let (config, sample_format) = input_config(&device, format.sample_rate)?;

        info!(
            "Opening input '{}' at {}Hz x{} ({:?})",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        let mut shaper = CaptureShaper::new(
            config.sample_rate.0,
            format.sample_rate,
            usize::from(config.channels),
            block_frames,
        )
        .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?;
        let mut scratch: Vec<f32> = Vec::new();

        let error_sink = sink.clone();
        let err_fn = move |err: cpal::StreamError| {
            error!("Input stream error: {}", err);
            error_sink.fail(CaptureError::Stream(err.to_string()));
        };

        let stream = match sample_format {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    shape(&mut shaper, &sink, data);
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|&s| s as f32 / PCM16_SCALE));
                    shape(&mut shaper, &sink, &scratch);
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|&s| (s as f32 - PCM16_SCALE) / PCM16_SCALE));
                    shape(&mut shaper, &sink, &scratch);
                },
                err_fn,
                None,
            ),
            other => {
                return Err(CaptureError::UnsupportedConfig(format!(
                    "sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

        stream.play().map_err(|e| CaptureError::Stream(e.to_string()))?;
        Ok(stream)
    }

    pub(super) fn playback_stream(
        name: Option<&str>,
        format: WireFormat,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<(Stream, MixerOutput), CaptureError> {
        let host = cpal::default_host();
        let device = match name {
            Some(name) => find_device(host.output_devices(), name)?,
            None => host.default_output_device().ok_or(CaptureError::NoOutputDevice)?,
        };
        let (config, sample_format) = output_config(&device, format.sample_rate)?;

        info!(
            "Opening output '{}' at {}Hz x{} ({:?})",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        let (mut mixer, output) = mixer(config.sample_rate.0, config.channels, completions);
        let mut scratch: Vec<f32> = Vec::new();
        let err_fn = |err: cpal::StreamError| error!("Output stream error: {}", err);

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| mixer.render(data),
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    mixer.render(&mut scratch);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = (sample * i16::MAX as f32) as i16;
                    }
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_output_stream(
                &config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    mixer.render(&mut scratch);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = ((sample + 1.0) * 0.5 * u16::MAX as f32) as u16;
                    }
                },
                err_fn,
                None,
            ),
            other => {
                return Err(CaptureError::UnsupportedConfig(format!(
                    "sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

        stream.play().map_err(|e| CaptureError::Stream(e.to_string()))?;
        Ok((stream, output))
    }
}
