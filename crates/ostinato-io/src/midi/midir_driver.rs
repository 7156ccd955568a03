//! Hardware MIDI input through midir.
//!
//! midir owns the receive thread; its callback pushes straight into the sink.

use super::{EventDriver, EventSink};
use crate::state::{DriverState, DriverStatus};
use crate::{Error, Result};
use midir::{Ignore, MidiInput, MidiInputConnection};
use std::sync::Arc;
use tracing::{debug, info};

const CLIENT_NAME: &str = "ostinato-input";

/// Holds a midir connection in a `Send` context.
///
/// Some backends keep raw client handles inside the connection. The driver is
/// owned by the engine's watchdog behind a `Mutex`, so the connection is never
/// touched from two threads at once.
struct ConnectionHandle(MidiInputConnection<()>);

// SAFETY: only accessed behind the engine's Mutex<Box<dyn EventDriver>>.
unsafe impl Send for ConnectionHandle {}

pub struct MidirDriver {
    port_name: Option<String>,
    connection: Option<ConnectionHandle>,
    status: Arc<DriverStatus>,
}

impl MidirDriver {
    pub fn new() -> Self {
        Self {
            port_name: None,
            connection: None,
            status: Arc::new(DriverStatus::new()),
        }
    }

    fn open_input() -> Result<MidiInput> {
        let mut input = MidiInput::new(CLIENT_NAME)?;
        input.ignore(Ignore::All);
        Ok(input)
    }
}

impl Default for MidirDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDriver for MidirDriver {
    fn name(&self) -> &'static str {
        "midir"
    }

    fn init(&mut self, device: Option<&str>) -> Result<()> {
        if self.connection.is_some() {
            return Err(Error::AlreadyRunning("midir"));
        }
        let names = self.list_devices()?;
        let chosen = match device {
            Some(wanted) => {
                let wanted = wanted.to_lowercase();
                names
                    .into_iter()
                    .find(|name| name.to_lowercase().contains(&wanted))
                    .ok_or_else(|| {
                        Error::InvalidDevice(format!(
                            "No MIDI input device found matching '{}'",
                            wanted
                        ))
                    })?
            }
            None => names
                .into_iter()
                .next()
                .ok_or_else(|| Error::InvalidDevice("No MIDI input device available".to_string()))?,
        };

        info!("MIDI input selected: {}", chosen);
        self.port_name = Some(chosen);
        self.status.set_state(DriverState::Stopped);
        Ok(())
    }

    fn start(&mut self, sink: Arc<dyn EventSink>) -> Result<()> {
        if self.connection.is_some() {
            return Err(Error::AlreadyRunning("midir"));
        }
        let wanted = self
            .port_name
            .clone()
            .ok_or(Error::NotInitialized("midir"))?;

        let input = Self::open_input()?;
        let ports = input.ports();
        let mut found = None;
        for port in ports.iter() {
            if input.port_name(port)? == wanted {
                found = Some(port.clone());
                break;
            }
        }
        let port = found.ok_or_else(|| Error::DeviceLost(wanted.clone()))?;

        let status = self.status.clone();
        let connection = input.connect(
            &port,
            "ostinato-in",
            move |_stamp, bytes, _| {
                sink.push(bytes);
                status.beat();
            },
            (),
        )?;

        debug!("MIDI input connected: {}", wanted);
        self.connection = Some(ConnectionHandle(connection));
        self.status.set_state(DriverState::Active);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(ConnectionHandle(connection)) = self.connection.take() {
            connection.close();
            self.status.set_state(DriverState::Stopped);
        }
    }

    fn status(&self) -> Arc<DriverStatus> {
        self.status.clone()
    }

    fn list_devices(&self) -> Result<Vec<String>> {
        let input = MidiInput::new("ostinato-device-list")?;
        let ports = input.ports();
        let mut names = Vec::with_capacity(ports.len());
        for (index, port) in ports.iter().enumerate() {
            let name = input
                .port_name(port)
                .unwrap_or_else(|_| format!("Unknown Device {}", index));
            names.push(name);
        }
        Ok(names)
    }

    fn device_name(&self) -> Option<String> {
        self.port_name.clone()
    }
}

impl Drop for MidirDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
