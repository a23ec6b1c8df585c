//! DMA channels
//!
//! A channel is programmed with source, destination, count and a start
//! timing. Immediate channels arm as soon as they are enabled; the others
//! arm when the machine reports the matching video event. The machine polls
//! [`Dma::check_on_access`] at memory-access time and performs the transfer
//! it returns, then reports completion.

use super::irq::{InterruptController, Irq};

pub const DMA_CHANNELS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaTiming {
    #[default]
    Immediate,
    VBlank,
    HBlank,
    Special,
}

impl DmaTiming {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            DmaTiming::Immediate => 0,
            DmaTiming::VBlank => 1,
            DmaTiming::HBlank => 2,
            DmaTiming::Special => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value & 3 {
            0 => DmaTiming::Immediate,
            1 => DmaTiming::VBlank,
            2 => DmaTiming::HBlank,
            _ => DmaTiming::Special,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaControl {
    pub enabled: bool,
    pub timing: DmaTiming,
    /// Stay enabled after a transfer and re-arm on the next event
    pub repeat: bool,
    pub irq_enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaChannel {
    pub(crate) source: u32,
    pub(crate) dest: u32,
    pub(crate) count: u32,
    pub(crate) control: DmaControl,
    pub(crate) armed: bool,
}

impl DmaChannel {
    pub fn control(&self) -> DmaControl {
        self.control
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

/// A transfer the machine has to carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTransfer {
    pub channel: usize,
    pub source: u32,
    pub dest: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dma {
    channels: [DmaChannel; DMA_CHANNELS],
    completed: u64,
}

impl Dma {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn channel(&self, index: usize) -> Option<&DmaChannel> {
        self.channels.get(index)
    }

    pub fn write_channel(&mut self, index: usize, source: u32, dest: u32, count: u32) {
        if let Some(channel) = self.channels.get_mut(index) {
            channel.source = source;
            channel.dest = dest;
            channel.count = count;
        }
    }

    pub fn write_control(&mut self, index: usize, control: DmaControl) {
        if let Some(channel) = self.channels.get_mut(index) {
            let starting = control.enabled && !channel.control.enabled;
            channel.control = control;
            channel.armed = if !control.enabled {
                false
            } else {
                channel.armed || (starting && control.timing == DmaTiming::Immediate)
            };
        }
    }

    /// Arm every enabled channel waiting on `timing`
    pub fn on_event(&mut self, timing: DmaTiming) {
        for channel in self.channels.iter_mut() {
            if channel.control.enabled && channel.control.timing == timing {
                channel.armed = true;
            }
        }
    }

    /// Highest-priority armed channel, if any
    pub fn check_on_access(&self) -> Option<DmaTransfer> {
        self.channels
            .iter()
            .enumerate()
            .find(|(_, channel)| channel.armed)
            .map(|(index, channel)| DmaTransfer {
                channel: index,
                source: channel.source,
                dest: channel.dest,
                count: channel.count,
            })
    }

    pub fn complete(&mut self, index: usize, irq: &mut InterruptController) {
        let Some(channel) = self.channels.get_mut(index) else {
            return;
        };
        channel.armed = false;
        if !channel.control.repeat || channel.control.timing == DmaTiming::Immediate {
            channel.control.enabled = false;
        }
        if channel.control.irq_enable {
            if let Some(line) = Irq::dma(index) {
                irq.raise(line);
            }
        }
        self.completed += 1;
    }

    pub fn any_armed(&self) -> bool {
        self.channels.iter().any(|channel| channel.armed)
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub(crate) fn set_completed(&mut self, completed: u64) {
        self.completed = completed;
    }

    pub(crate) fn channels(&self) -> &[DmaChannel; DMA_CHANNELS] {
        &self.channels
    }

    pub(crate) fn channels_mut(&mut self) -> &mut [DmaChannel; DMA_CHANNELS] {
        &mut self.channels
    }
}
