//! Sound parameters the allocator and renderer read.

use crate::envelope::{EnvelopeParams, TimeTable};

/// Per-part patch state. Mutated only by the owning synthesis thread.
#[derive(Debug, Clone)]
pub struct Patch {
    pub amp: EnvelopeParams,
    pub filter: EnvelopeParams,
    /// Glide time control (CC5), 0 disables portamento.
    pub portamento: u8,
    /// 0.0 = velocity ignored, 1.0 = fully velocity scaled.
    pub velocity_sensitivity: f32,
    /// Pitch bend range in semitones.
    pub bend_range: f32,
    pub volume: f32,
}

impl Default for Patch {
    fn default() -> Self {
        Self {
            amp: EnvelopeParams::default(),
            filter: EnvelopeParams {
                attack: 20,
                decay: 60,
                sustain: 64,
                release: 50,
            },
            portamento: 0,
            velocity_sensitivity: 0.7,
            bend_range: 2.0,
            volume: 0.25,
        }
    }
}

impl Patch {
    /// Glide length in samples for the current portamento control.
    pub fn glide_samples(&self, table: &TimeTable) -> u32 {
        if self.portamento == 0 {
            0
        } else {
            table.samples(self.portamento)
        }
    }

    /// Linear gain for a note-on velocity.
    pub fn velocity_gain(&self, velocity: u8) -> f32 {
        let normalized = velocity.min(127) as f32 / 127.0;
        1.0 - self.velocity_sensitivity + self.velocity_sensitivity * normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_velocity_gain() {
        let patch = Patch {
            velocity_sensitivity: 1.0,
            ..Default::default()
        };
        assert_relative_eq!(patch.velocity_gain(127), 1.0);
        assert_relative_eq!(patch.velocity_gain(0), 0.0);

        let flat = Patch {
            velocity_sensitivity: 0.0,
            ..Default::default()
        };
        assert_relative_eq!(flat.velocity_gain(1), 1.0);
    }

    #[test]
    fn test_portamento_off_means_no_glide() {
        let table = TimeTable::new(48000.0);
        let mut patch = Patch::default();
        assert_eq!(patch.glide_samples(&table), 0);
        patch.portamento = 40;
        assert_eq!(patch.glide_samples(&table), table.samples(40));
    }
}
