//! Boundary to the fixture hardware. Channel numbering lives here and only
//! here; everything upstream deals in named color fields.

use serde::{Deserialize, Serialize};

use crate::{ChannelWrite, LightSyncError, Result, Rgb};

pub const UNIVERSE_SIZE: u16 = 512;

/// Anything that accepts DMX-style channel writes.
pub trait OutputSink {
    fn write_channel(&mut self, channel: u16, value: u8) -> Result<()>;

    fn apply_writes(&mut self, writes: &[ChannelWrite]) -> Result<()> {
        for write in writes {
            self.write_channel(write.channel, write.value)?;
        }
        Ok(())
    }
}

/// In-memory 512 channel universe.
#[derive(Debug, Clone)]
pub struct DmxUniverse {
    channels: [u8; UNIVERSE_SIZE as usize],
    writes: u64,
}

impl Default for DmxUniverse {
    fn default() -> Self {
        Self {
            channels: [0; UNIVERSE_SIZE as usize],
            writes: 0,
        }
    }
}

impl DmxUniverse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a 1-based channel, `None` outside the universe.
    pub fn get(&self, channel: u16) -> Option<u8> {
        channel
            .checked_sub(1)
            .and_then(|index| self.channels.get(index as usize))
            .copied()
    }

    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    pub fn write_count(&self) -> u64 {
        self.writes
    }

    pub fn blackout(&mut self) {
        self.channels = [0; UNIVERSE_SIZE as usize];
    }
}

impl OutputSink for DmxUniverse {
    fn write_channel(&mut self, channel: u16, value: u8) -> Result<()> {
        if !(1..=UNIVERSE_SIZE).contains(&channel) {
            return Err(LightSyncError::Channel { channel });
        }
        self.channels[usize::from(channel - 1)] = value;
        self.writes += 1;
        Ok(())
    }
}

/// Channel offsets (0-based, relative to the fixture start address) of an
/// RGB fixture archetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbLayout {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
    #[serde(default)]
    pub dimmer: Option<u16>,
}

impl RgbLayout {
    /// Plain 3 channel RGB par.
    pub const PAR_RGB: Self = Self {
        red: 0,
        green: 1,
        blue: 2,
        dimmer: None,
    };

    /// Dimmer first, then RGB.
    pub const PAR_DRGB: Self = Self {
        red: 1,
        green: 2,
        blue: 3,
        dimmer: Some(0),
    };
}

/// A patched fixture: identity, start address and channel layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbFixture {
    pub id: String,
    pub start_address: u16,
    pub layout: RgbLayout,
}

impl RgbFixture {
    pub fn new(id: impl Into<String>, start_address: u16, layout: RgbLayout) -> Self {
        Self {
            id: id.into(),
            start_address,
            layout,
        }
    }

    fn address(&self, offset: u16) -> u16 {
        self.start_address.saturating_add(offset)
    }

    /// Writes a color (and dimmer, when the layout has one) to the sink.
    pub fn apply_color(&self, sink: &mut dyn OutputSink, color: Rgb, dimmer: u8) -> Result<()> {
        sink.write_channel(self.address(self.layout.red), color.r)?;
        sink.write_channel(self.address(self.layout.green), color.g)?;
        sink.write_channel(self.address(self.layout.blue), color.b)?;
        if let Some(offset) = self.layout.dimmer {
            sink.write_channel(self.address(offset), dimmer)?;
        }
        Ok(())
    }
}
