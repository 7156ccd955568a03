use super::{AudioDriver, AudioRequest, PeriodCallback};
use crate::state::{AudioFormat, DriverFault, DriverState, DriverStatus};
use crate::Result;
use std::sync::Arc;

/// Accepts any format and never calls back. The engine idles.
#[derive(Debug, Default)]
pub struct NoneAudioDriver {
    status: Arc<DriverStatus>,
}

impl NoneAudioDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioDriver for NoneAudioDriver {
    fn name(&self) -> &'static str {
        "none"
    }

    fn init(&mut self, request: &AudioRequest) -> Result<AudioFormat> {
        Ok(AudioFormat {
            sample_rate: request.sample_rate,
            period_size: request.period_size,
            channels: 2,
        })
    }

    fn start(&mut self, _callback: PeriodCallback) -> Result<()> {
        self.status.set_state(DriverState::None);
        Ok(())
    }

    fn stop(&mut self) {}

    fn xrun_recovery(&mut self, _fault: DriverFault) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> Arc<DriverStatus> {
        self.status.clone()
    }

    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
