//! Event input drivers.
//!
//! An event driver owns the thread raw MIDI arrives on. It pushes each
//! message into an [`EventSink`] as soon as it is received; the sink
//! timestamps it against the PLL and routes it to the part queues.

mod none;
mod virtual_input;

#[cfg(feature = "midi-io")]
mod midir_driver;

pub use none::NoneEventDriver;
pub use virtual_input::{RawMessage, VirtualEventDriver, VirtualPort};

#[cfg(feature = "midi-io")]
pub use midir_driver::MidirDriver;

use crate::state::DriverStatus;
use crate::{Error, Result};
use ostinato_core::EventDispatcher;
use std::sync::Arc;

/// Receiver of raw MIDI bytes on the event input thread.
///
/// Must not block: it runs on the driver's receive thread.
pub trait EventSink: Send + Sync + 'static {
    /// Returns how many consumers accepted the message.
    fn push(&self, bytes: &[u8]) -> usize;
}

impl EventSink for EventDispatcher {
    fn push(&self, bytes: &[u8]) -> usize {
        self.dispatch_raw(bytes)
    }
}

pub trait EventDriver: Send {
    fn name(&self) -> &'static str;

    /// Open the input port. `device` is a name substring; `None` picks the first.
    fn init(&mut self, device: Option<&str>) -> Result<()>;

    fn start(&mut self, sink: Arc<dyn EventSink>) -> Result<()>;

    /// Stop receiving. Blocks until the sink can no longer be called.
    fn stop(&mut self);

    fn status(&self) -> Arc<DriverStatus>;

    fn list_devices(&self) -> Result<Vec<String>>;

    fn device_name(&self) -> Option<String> {
        None
    }

    /// In-process sender for drivers that have one.
    fn virtual_port(&self) -> Option<VirtualPort> {
        None
    }
}

pub fn event_driver_names() -> &'static [&'static str] {
    #[cfg(feature = "midi-io")]
    {
        &["none", "virtual", "midir"]
    }
    #[cfg(not(feature = "midi-io"))]
    {
        &["none", "virtual"]
    }
}

/// Select an event driver by name.
pub fn create_event_driver(name: &str) -> Result<Box<dyn EventDriver>> {
    match name {
        "none" => Ok(Box::new(NoneEventDriver::new())),
        "virtual" => Ok(Box::new(VirtualEventDriver::new())),
        #[cfg(feature = "midi-io")]
        "midir" => Ok(Box::new(MidirDriver::new())),
        other => Err(Error::UnknownDriver {
            subsystem: "event",
            name: other.to_string(),
        }),
    }
}
