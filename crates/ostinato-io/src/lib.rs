//! Driver layer for Ostinato.
//!
//! - **Audio**: [`AudioDriver`] with `none`, `timer` and `cpal` variants
//! - **Events**: [`EventDriver`] with `none`, `virtual` and `midir` variants
//! - **[`DeviceRegistry`]**: enumerated devices with hot-plug request flags
//! - **[`DriverStatus`]**: lock-free state, fault and heartbeat reporting
//!
//! Drivers are selected by name at configuration time:
//!
//! ```ignore
//! use ostinato_io::{create_audio_driver, AudioRequest};
//!
//! let mut audio = create_audio_driver("timer")?;
//! let format = audio.init(&AudioRequest { sample_rate: 48000, period_size: 256, device: None })?;
//! audio.start(Box::new(|buffer: &mut [f32]| buffer.fill(0.0)))?;
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod audio;
pub use audio::{
    audio_driver_names, create_audio_driver, AudioDriver, AudioRequest, NoneAudioDriver,
    PeriodCallback, TimerDriver,
};

#[cfg(feature = "cpal")]
pub use audio::CpalDriver;

pub mod midi;
pub use midi::{
    create_event_driver, event_driver_names, EventDriver, EventSink, NoneEventDriver, RawMessage,
    VirtualEventDriver, VirtualPort,
};

#[cfg(feature = "midi-io")]
pub use midi::MidirDriver;

mod registry;
pub use registry::{DeviceInfo, DeviceRegistry, RegistryChange, Subsystem};

mod state;
pub use state::{AudioFormat, DriverFault, DriverState, DriverStatus};
