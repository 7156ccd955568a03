//! Audio drivers.
//!
//! A driver negotiates a format in [`AudioDriver::init`], then calls the
//! period callback from its own thread once per hardware period with an
//! interleaved stereo buffer to fill. Faults are reported through the shared
//! [`DriverStatus`]; the watchdog decides what to do about them.

mod none;
mod timer;

#[cfg(feature = "cpal")]
mod cpal_driver;

pub use none::NoneAudioDriver;
pub use timer::TimerDriver;

#[cfg(feature = "cpal")]
pub use cpal_driver::CpalDriver;

use crate::state::{AudioFormat, DriverFault, DriverStatus};
use crate::{Error, Result};
use std::sync::Arc;

/// Fills an interleaved stereo buffer; `buffer.len() / 2` frames.
///
/// Runs on the driver's real-time thread: must not block, allocate or log.
pub type PeriodCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// What the engine asks the hardware for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRequest {
    pub sample_rate: u32,
    pub period_size: usize,
    /// Device name (substring match); `None` selects the default device.
    pub device: Option<String>,
}

pub trait AudioDriver: Send {
    fn name(&self) -> &'static str;

    /// Open the device and negotiate a format. The hardware may not honour
    /// the request; the returned format is authoritative.
    fn init(&mut self, request: &AudioRequest) -> Result<AudioFormat>;

    /// Start delivering periods to `callback`.
    fn start(&mut self, callback: PeriodCallback) -> Result<()>;

    /// Stop delivering periods. Blocks until the callback can no longer run.
    fn stop(&mut self);

    /// Recover from a fault reported through the status. `Ok` means the
    /// stream is running again and the engine only needs to resync.
    fn xrun_recovery(&mut self, fault: DriverFault) -> Result<()>;

    fn status(&self) -> Arc<DriverStatus>;

    /// Names of the devices this driver can open.
    fn list_devices(&self) -> Result<Vec<String>>;

    /// Name of the device currently open, if any.
    fn device_name(&self) -> Option<String> {
        None
    }
}

/// Names accepted by [`create_audio_driver`].
pub fn audio_driver_names() -> &'static [&'static str] {
    #[cfg(feature = "cpal")]
    {
        &["none", "timer", "cpal"]
    }
    #[cfg(not(feature = "cpal"))]
    {
        &["none", "timer"]
    }
}

/// Select an audio driver by name.
pub fn create_audio_driver(name: &str) -> Result<Box<dyn AudioDriver>> {
    match name {
        "none" => Ok(Box::new(NoneAudioDriver::new())),
        "timer" => Ok(Box::new(TimerDriver::new())),
        #[cfg(feature = "cpal")]
        "cpal" => Ok(Box::new(CpalDriver::new())),
        other => Err(Error::UnknownDriver {
            subsystem: "audio",
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_by_name() {
        assert_eq!(create_audio_driver("timer").unwrap().name(), "timer");
        assert_eq!(create_audio_driver("none").unwrap().name(), "none");
        assert!(matches!(
            create_audio_driver("jack"),
            Err(Error::UnknownDriver { .. })
        ));
    }
}
