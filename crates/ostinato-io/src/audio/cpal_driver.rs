//! Hardware audio output through CPAL.

use super::{AudioDriver, AudioRequest, PeriodCallback};
use crate::state::{AudioFormat, DriverFault, DriverState, DriverStatus};
use crate::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest block handed to the period callback in one go. Hosts that deliver
/// more frames per callback are served in several blocks.
const SCRATCH_FRAMES: usize = 8192;

/// Wrapper to hold a `cpal::Stream` in a `Send` context.
///
/// `cpal::Stream` is `!Send` due to platform internals. The driver is owned by
/// the engine's watchdog behind a `Mutex`, so the stream is never accessed
/// concurrently, and it is dropped by whichever thread stops the driver.
struct StreamHandle(cpal::Stream);

// SAFETY: only accessed behind the engine's Mutex<Box<dyn AudioDriver>>; never
// used from two threads at once.
unsafe impl Send for StreamHandle {}

struct OpenDevice {
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    name: String,
}

pub struct CpalDriver {
    open: Option<OpenDevice>,
    stream: Option<StreamHandle>,
    status: Arc<DriverStatus>,
}

impl CpalDriver {
    pub fn new() -> Self {
        Self {
            open: None,
            stream: None,
            status: Arc::new(DriverStatus::new()),
        }
    }

    fn find_device(name: Option<&str>) -> Result<cpal::Device> {
        let host = cpal::default_host();

        if let Some(wanted) = name {
            let wanted = wanted.to_lowercase();
            for device in host.output_devices()? {
                if device.name()?.to_lowercase().contains(&wanted) {
                    return Ok(device);
                }
            }
            Err(Error::InvalidDevice(format!(
                "No output device found matching '{}'",
                wanted
            )))
        } else {
            host.default_output_device()
                .ok_or_else(|| Error::InvalidDevice("No output device available".to_string()))
        }
    }

    /// Requested rate if any stereo config supports it, else the device default.
    fn negotiate_rate(device: &cpal::Device, requested: u32, fallback: u32) -> Result<u32> {
        let supported = device.supported_output_configs()?.any(|range| {
            range.channels() >= 2
                && range.min_sample_rate().0 <= requested
                && requested <= range.max_sample_rate().0
        });
        Ok(if supported { requested } else { fallback })
    }

    fn negotiate_period(buffer_size: &cpal::SupportedBufferSize, requested: usize) -> usize {
        match buffer_size {
            cpal::SupportedBufferSize::Range { min, max } => {
                let (min, max) = (*min as usize, *max as usize);
                if (min..=max).contains(&requested) {
                    requested
                } else {
                    min.max(1).next_power_of_two().min(max.max(1))
                }
            }
            cpal::SupportedBufferSize::Unknown => requested,
        }
    }

    fn build_stream<T>(
        &self,
        open: &OpenDevice,
        mut callback: PeriodCallback,
    ) -> Result<cpal::Stream>
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let channels = open.config.channels as usize;
        let mut scratch = vec![0.0f32; SCRATCH_FRAMES * 2];
        let status = self.status.clone();
        let error_status = self.status.clone();

        let stream = open.device.build_output_stream(
            &open.config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    for block in data.chunks_mut(SCRATCH_FRAMES * channels) {
                        let frames = block.len() / channels;
                        let stereo = &mut scratch[..frames * 2];
                        stereo.fill(0.0);
                        callback(stereo);

                        for (frame, samples) in block.chunks_mut(channels).enumerate() {
                            let (left, right) = (stereo[frame * 2], stereo[frame * 2 + 1]);
                            for (channel, sample) in samples.iter_mut().enumerate() {
                                let value = match (channels, channel) {
                                    (1, _) => (left + right) * 0.5,
                                    (_, 0) => left,
                                    (_, 1) => right,
                                    _ => 0.0,
                                };
                                *sample = T::from_sample(value);
                            }
                        }
                    }
                }));

                if result.is_err() {
                    for sample in data.iter_mut() {
                        *sample = T::from_sample(0.0);
                    }
                }
                status.beat();
            },
            move |err| match err {
                cpal::StreamError::DeviceNotAvailable => {
                    error_status.record_fault(DriverFault::Disconnected)
                }
                _ => error_status.record_fault(DriverFault::Underrun),
            },
            None,
        )?;

        Ok(stream)
    }
}

impl Default for CpalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDriver for CpalDriver {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn init(&mut self, request: &AudioRequest) -> Result<AudioFormat> {
        if self.stream.is_some() {
            return Err(Error::AlreadyRunning("cpal"));
        }

        let device = Self::find_device(request.device.as_deref())?;
        let name = device.name()?;
        let default = device.default_output_config()?;
        let sample_rate = Self::negotiate_rate(&device, request.sample_rate, default.sample_rate().0)?;
        let period_size = Self::negotiate_period(default.buffer_size(), request.period_size);
        if !period_size.is_power_of_two() {
            return Err(Error::UnsupportedFormat(format!(
                "device '{}' cannot run a power-of-two period near {}",
                name, request.period_size
            )));
        }

        let channels = default.channels().max(1);
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(period_size as u32),
        };
        if sample_rate != request.sample_rate || period_size != request.period_size {
            info!(
                "Audio device '{}' negotiated {} Hz / {} frames (requested {} Hz / {} frames)",
                name, sample_rate, period_size, request.sample_rate, request.period_size
            );
        }

        self.open = Some(OpenDevice {
            device,
            config,
            sample_format: default.sample_format(),
            name,
        });
        self.status.set_state(DriverState::Stopped);
        Ok(AudioFormat {
            sample_rate,
            period_size,
            channels,
        })
    }

    fn start(&mut self, callback: PeriodCallback) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::AlreadyRunning("cpal"));
        }
        let open = self.open.as_ref().ok_or(Error::NotInitialized("cpal"))?;

        let stream = match open.sample_format {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(open, callback)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(open, callback)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(open, callback)?,
            format => {
                return Err(Error::UnsupportedFormat(format!(
                    "sample format {:?}",
                    format
                )));
            }
        };
        stream.play()?;

        debug!("CPAL stream started on '{}'", open.name);
        self.stream = Some(StreamHandle(stream));
        self.status.set_state(DriverState::Active);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(StreamHandle(stream)) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Failed to pause stream before drop: {}", e);
            }
        }
        if self.status.state() == DriverState::Active {
            self.status.set_state(DriverState::Stopped);
        }
    }

    fn xrun_recovery(&mut self, fault: DriverFault) -> Result<()> {
        let Some(StreamHandle(stream)) = self.stream.as_ref() else {
            return Err(Error::NotInitialized("cpal"));
        };
        match fault {
            DriverFault::Underrun | DriverFault::Overrun => Ok(()),
            DriverFault::Suspended => {
                warn!("Audio stream suspended, resuming");
                stream.play()?;
                Ok(())
            }
            DriverFault::Disconnected => {
                let name = self.device_name().unwrap_or_default();
                Err(Error::DeviceLost(name))
            }
        }
    }

    fn status(&self) -> Arc<DriverStatus> {
        self.status.clone()
    }

    fn list_devices(&self) -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Result<Vec<String>> = host
            .output_devices()?
            .map(|device| Ok(device.name()?))
            .collect();
        devices
    }

    fn device_name(&self) -> Option<String> {
        self.open.as_ref().map(|open| open.name.clone())
    }
}
