//! Interrupt controller
//!
//! Fourteen interrupt lines with an enable mask (IE), request flags (IF) and
//! a master enable (IME). Requests latch until acknowledged; raising a line
//! that is already pending is a no-op.

use bitflags::bitflags;

/// Interrupt lines, numbered by priority (lowest wins)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Irq {
    VBlank = 0x0,
    HBlank = 0x1,
    VCounter = 0x2,
    Timer0 = 0x3,
    Timer1 = 0x4,
    Timer2 = 0x5,
    Timer3 = 0x6,
    Serial = 0x7,
    Dma0 = 0x8,
    Dma1 = 0x9,
    Dma2 = 0xA,
    Dma3 = 0xB,
    Keypad = 0xC,
    GamePak = 0xD,
}

impl Irq {
    pub const ALL: [Irq; 14] = [
        Irq::VBlank,
        Irq::HBlank,
        Irq::VCounter,
        Irq::Timer0,
        Irq::Timer1,
        Irq::Timer2,
        Irq::Timer3,
        Irq::Serial,
        Irq::Dma0,
        Irq::Dma1,
        Irq::Dma2,
        Irq::Dma3,
        Irq::Keypad,
        Irq::GamePak,
    ];

    pub fn mask(self) -> IrqSet {
        IrqSet::from_bits_truncate(1 << self as u16)
    }

    pub fn timer(index: usize) -> Option<Irq> {
        [Irq::Timer0, Irq::Timer1, Irq::Timer2, Irq::Timer3].get(index).copied()
    }

    pub fn dma(index: usize) -> Option<Irq> {
        [Irq::Dma0, Irq::Dma1, Irq::Dma2, Irq::Dma3].get(index).copied()
    }
}

bitflags! {
    /// Set of interrupt lines, laid out like the IE/IF registers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IrqSet: u16 {
        const VBLANK = 1 << 0;
        const HBLANK = 1 << 1;
        const VCOUNTER = 1 << 2;
        const TIMER0 = 1 << 3;
        const TIMER1 = 1 << 4;
        const TIMER2 = 1 << 5;
        const TIMER3 = 1 << 6;
        const SERIAL = 1 << 7;
        const DMA0 = 1 << 8;
        const DMA1 = 1 << 9;
        const DMA2 = 1 << 10;
        const DMA3 = 1 << 11;
        const KEYPAD = 1 << 12;
        const GAMEPAK = 1 << 13;
    }
}

impl IrqSet {
    /// Lines allowed to leave stop mode
    pub const STOP_WAKE: IrqSet = IrqSet::KEYPAD.union(IrqSet::GAMEPAK).union(IrqSet::SERIAL);

    /// Highest-priority line in the set
    pub fn first(self) -> Option<Irq> {
        if self.is_empty() {
            return None;
        }
        Irq::ALL.get(self.bits().trailing_zeros() as usize).copied()
    }
}

/// CPU low-power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    Running,
    /// Halted until an enabled interrupt is requested
    Halted,
    /// Stopped until keypad, game pak or serial
    Stopped,
}

impl PowerState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            PowerState::Running => 0,
            PowerState::Halted => 1,
            PowerState::Stopped => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PowerState::Running),
            1 => Some(PowerState::Halted),
            2 => Some(PowerState::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptController {
    enabled: IrqSet,
    pending: IrqSet,
    master_enable: bool,
    power: PowerState,
    raised: u64,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Request a line. Returns false if it was already pending.
    pub fn raise(&mut self, irq: Irq) -> bool {
        if self.pending.contains(irq.mask()) {
            return false;
        }
        self.pending.insert(irq.mask());
        self.raised += 1;
        true
    }

    pub fn pending(&self) -> IrqSet {
        self.pending
    }

    pub fn enabled(&self) -> IrqSet {
        self.enabled
    }

    pub fn master_enable(&self) -> bool {
        self.master_enable
    }

    /// IF write: set bits clear the matching requests
    pub fn acknowledge(&mut self, lines: IrqSet) {
        self.pending.remove(lines);
    }

    pub fn clear_all(&mut self) {
        self.pending = IrqSet::empty();
    }

    pub fn write_ie(&mut self, value: u16) {
        self.enabled = IrqSet::from_bits_truncate(value);
    }

    pub fn write_ime(&mut self, value: u16) {
        self.master_enable = value & 1 != 0;
    }

    /// Line the CPU should service before its next instruction
    pub fn next_dispatch(&self) -> Option<Irq> {
        if !self.master_enable || self.power != PowerState::Running {
            return None;
        }
        (self.enabled & self.pending).first()
    }

    pub fn power(&self) -> PowerState {
        self.power
    }

    pub fn halt(&mut self) {
        self.power = PowerState::Halted;
    }

    pub fn stop(&mut self) {
        self.power = PowerState::Stopped;
    }

    /// Whether a pending request releases the current low-power state
    pub fn wake_requested(&self) -> bool {
        let active = self.enabled & self.pending;
        match self.power {
            PowerState::Running => true,
            PowerState::Halted => !active.is_empty(),
            PowerState::Stopped => active.intersects(IrqSet::STOP_WAKE),
        }
    }

    pub fn wake(&mut self) {
        self.power = PowerState::Running;
    }

    /// Total requests latched since reset
    pub fn raised_count(&self) -> u64 {
        self.raised
    }

    pub(crate) fn restore_raw(
        &mut self,
        enabled: u16,
        pending: u16,
        ime: bool,
        power: PowerState,
        raised: u64,
    ) {
        self.enabled = IrqSet::from_bits_truncate(enabled);
        self.pending = IrqSet::from_bits_truncate(pending);
        self.master_enable = ime;
        self.power = power;
        self.raised = raised;
    }
}
