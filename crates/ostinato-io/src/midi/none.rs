use super::{EventDriver, EventSink};
use crate::state::DriverStatus;
use crate::Result;
use std::sync::Arc;

/// No event input. The engine only hears internal events.
#[derive(Debug, Default)]
pub struct NoneEventDriver {
    status: Arc<DriverStatus>,
}

impl NoneEventDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventDriver for NoneEventDriver {
    fn name(&self) -> &'static str {
        "none"
    }

    fn init(&mut self, _device: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, _sink: Arc<dyn EventSink>) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn status(&self) -> Arc<DriverStatus> {
        self.status.clone()
    }

    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
