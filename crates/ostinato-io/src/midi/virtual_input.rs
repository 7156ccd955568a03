//! In-process MIDI input.
//!
//! Messages sent through a [`VirtualPort`] travel over a bounded crossbeam
//! channel to the driver's receive thread, which pushes them into the sink
//! exactly like a hardware input would.

use super::{EventDriver, EventSink};
use crate::state::{DriverState, DriverStatus};
use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

/// A short MIDI message stored inline (no allocation per message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage {
    bytes: [u8; 3],
    len: u8,
}

impl RawMessage {
    /// Copy a 1-3 byte message. Longer messages (SysEx) are not carried.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > 3 {
            return None;
        }
        let mut inline = [0u8; 3];
        inline[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            bytes: inline,
            len: bytes.len() as u8,
        })
    }

    fn channel_message(status: u8, channel: u8, data1: u8, data2: u8) -> Self {
        Self {
            bytes: [status | channel.min(15), data1 & 0x7F, data2 & 0x7F],
            len: 3,
        }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel_message(0x90, channel, note, velocity)
    }

    pub fn note_off(channel: u8, note: u8) -> Self {
        Self::channel_message(0x80, channel, note, 0)
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::channel_message(0xB0, channel, controller, value)
    }

    pub fn pitch_bend(channel: u8, value: i16) -> Self {
        let raw = (value.clamp(-8192, 8191) + 8192) as u16;
        Self::channel_message(0xE0, channel, (raw & 0x7F) as u8, (raw >> 7) as u8)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

enum VirtualCommand {
    Message(RawMessage),
    Shutdown,
}

/// Cloneable sending end of a virtual input.
#[derive(Clone)]
pub struct VirtualPort {
    sender: Sender<VirtualCommand>,
}

impl VirtualPort {
    /// Queue a message. Returns `false` if the channel is full.
    pub fn send(&self, message: RawMessage) -> bool {
        self.sender
            .try_send(VirtualCommand::Message(message))
            .is_ok()
    }

    /// Queue raw bytes; anything that is not a 1-3 byte message is refused.
    pub fn send_bytes(&self, bytes: &[u8]) -> bool {
        RawMessage::from_slice(bytes).is_some_and(|message| self.send(message))
    }

    pub fn note_on(&self, channel: u8, note: u8, velocity: u8) -> bool {
        self.send(RawMessage::note_on(channel, note, velocity))
    }

    pub fn note_off(&self, channel: u8, note: u8) -> bool {
        self.send(RawMessage::note_off(channel, note))
    }

    pub fn control_change(&self, channel: u8, controller: u8, value: u8) -> bool {
        self.send(RawMessage::control_change(channel, controller, value))
    }
}

impl std::fmt::Debug for VirtualPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPort")
            .field("queued", &self.sender.len())
            .finish()
    }
}

pub struct VirtualEventDriver {
    sender: Sender<VirtualCommand>,
    receiver: Receiver<VirtualCommand>,
    status: Arc<DriverStatus>,
    thread: Option<JoinHandle<()>>,
}

impl VirtualEventDriver {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        Self {
            sender,
            receiver,
            status: Arc::new(DriverStatus::new()),
            thread: None,
        }
    }

    pub fn port(&self) -> VirtualPort {
        VirtualPort {
            sender: self.sender.clone(),
        }
    }

    fn receive_loop(
        receiver: Receiver<VirtualCommand>,
        sink: Arc<dyn EventSink>,
        status: Arc<DriverStatus>,
    ) {
        loop {
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(VirtualCommand::Message(message)) => {
                    sink.push(message.as_bytes());
                    status.beat();
                }
                Ok(VirtualCommand::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

impl Default for VirtualEventDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDriver for VirtualEventDriver {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn init(&mut self, _device: Option<&str>) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::AlreadyRunning("virtual"));
        }
        self.status.set_state(DriverState::Stopped);
        Ok(())
    }

    fn start(&mut self, sink: Arc<dyn EventSink>) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::AlreadyRunning("virtual"));
        }
        let receiver = self.receiver.clone();
        let status = self.status.clone();
        let handle = thread::Builder::new()
            .name("ostinato-virtual-midi".into())
            .spawn(move || Self::receive_loop(receiver, sink, status))?;

        self.thread = Some(handle);
        self.status.set_state(DriverState::Active);
        debug!("Virtual event driver started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            // Blocking send: a full channel still has to deliver the shutdown.
            let _ = self.sender.send(VirtualCommand::Shutdown);
            let _ = handle.join();
            self.status.set_state(DriverState::Stopped);
        }
    }

    fn status(&self) -> Arc<DriverStatus> {
        self.status.clone()
    }

    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(vec!["virtual".to_string()])
    }

    fn device_name(&self) -> Option<String> {
        Some("virtual".to_string())
    }

    fn virtual_port(&self) -> Option<VirtualPort> {
        Some(self.port())
    }
}

impl Drop for VirtualEventDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors_clamp_and_mask() {
        assert_eq!(RawMessage::note_on(3, 60, 100).as_bytes(), &[0x93, 60, 100]);
        assert_eq!(RawMessage::note_on(200, 0xFF, 0xFF).as_bytes(), &[0x9F, 0x7F, 0x7F]);
        assert_eq!(RawMessage::note_off(0, 60).as_bytes(), &[0x80, 60, 0]);

        let center = RawMessage::pitch_bend(0, 0);
        let bytes = center.as_bytes();
        assert_eq!((bytes[1] as u16) | ((bytes[2] as u16) << 7), 8192);
    }

    #[test]
    fn test_from_slice_limits() {
        assert!(RawMessage::from_slice(&[]).is_none());
        assert!(RawMessage::from_slice(&[0xF0, 1, 2, 3, 0xF7]).is_none());
        assert_eq!(RawMessage::from_slice(&[0xFA]).unwrap().as_bytes(), &[0xFA]);
    }

    #[test]
    fn test_port_refuses_when_full() {
        let driver = VirtualEventDriver::new();
        let port = driver.port();
        for _ in 0..CHANNEL_CAPACITY {
            assert!(port.note_on(0, 60, 1));
        }
        assert!(!port.note_on(0, 60, 1));
    }
}
