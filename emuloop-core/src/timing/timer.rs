//! Countdown timers
//!
//! Four timers clocked from the master clock through a prescaler. A timer
//! counts down from its reload value; ticking past zero is an underflow,
//! which reloads the counter, raises the timer's interrupt if enabled, and
//! clocks the next timer when that one is in cascade mode.

use super::irq::{InterruptController, Irq};

pub const TIMER_COUNT: usize = 4;

/// Master-clock cycles per timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Prescaler {
    #[default]
    Div1,
    Div64,
    Div256,
    Div1024,
}

impl Prescaler {
    pub fn cycles(self) -> u64 {
        match self {
            Prescaler::Div1 => 1,
            Prescaler::Div64 => 64,
            Prescaler::Div256 => 256,
            Prescaler::Div1024 => 1024,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Prescaler::Div1 => 0,
            Prescaler::Div64 => 1,
            Prescaler::Div256 => 2,
            Prescaler::Div1024 => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value & 3 {
            0 => Prescaler::Div1,
            1 => Prescaler::Div64,
            2 => Prescaler::Div256,
            _ => Prescaler::Div1024,
        }
    }
}

/// Control register contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerControl {
    pub enabled: bool,
    pub prescaler: Prescaler,
    /// Clocked by the previous timer's underflows instead of the prescaler
    pub cascade: bool,
    pub irq_enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timer {
    pub(crate) reload: u16,
    pub(crate) counter: u16,
    pub(crate) control: TimerControl,
    /// Master cycles not yet worth a tick
    pub(crate) remainder: u64,
}

impl Timer {
    pub fn counter(&self) -> u16 {
        self.counter
    }

    pub fn reload(&self) -> u16 {
        self.reload
    }

    pub fn control(&self) -> TimerControl {
        self.control
    }

    /// Count down `ticks`; returns the number of underflows
    fn clock(&mut self, ticks: u64) -> u64 {
        if ticks <= self.counter as u64 {
            self.counter -= ticks as u16;
            return 0;
        }
        let period = self.reload as u64 + 1;
        let mut remaining = ticks - (self.counter as u64 + 1);
        let underflows = 1 + remaining / period;
        remaining %= period;
        self.counter = self.reload - remaining as u16;
        underflows
    }

    /// Master cycles until the next underflow, for prescaler-clocked timers
    fn cycles_to_underflow(&self) -> Option<u64> {
        if !self.control.enabled || self.control.cascade {
            return None;
        }
        let div = self.control.prescaler.cycles();
        Some((self.counter as u64 + 1) * div - self.remainder)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timers {
    timers: [Timer; TIMER_COUNT],
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn get(&self, index: usize) -> Option<&Timer> {
        self.timers.get(index)
    }

    pub fn write_reload(&mut self, index: usize, reload: u16) {
        if let Some(timer) = self.timers.get_mut(index) {
            timer.reload = reload;
        }
    }

    /// Starting a stopped timer latches the reload value
    pub fn write_control(&mut self, index: usize, control: TimerControl) {
        if let Some(timer) = self.timers.get_mut(index) {
            if control.enabled && !timer.control.enabled {
                timer.counter = timer.reload;
                timer.remainder = 0;
            }
            timer.control = control;
        }
    }

    /// Advance all timers by `cycles` master cycles
    pub fn tick(&mut self, cycles: u64, irq: &mut InterruptController) {
        let mut carry = 0u64;
        for (index, timer) in self.timers.iter_mut().enumerate() {
            if !timer.control.enabled {
                carry = 0;
                continue;
            }
            let ticks = if timer.control.cascade && index > 0 {
                carry
            } else {
                let div = timer.control.prescaler.cycles();
                let total = timer.remainder + cycles;
                timer.remainder = total % div;
                total / div
            };
            carry = timer.clock(ticks);
            if carry > 0 && timer.control.irq_enable {
                if let Some(line) = Irq::timer(index) {
                    irq.raise(line);
                }
            }
        }
    }

    /// Master cycles until any timer underflows
    pub fn cycles_until_next_event(&self) -> Option<u64> {
        self.timers.iter().filter_map(Timer::cycles_to_underflow).min()
    }

    pub(crate) fn timers(&self) -> &[Timer; TIMER_COUNT] {
        &self.timers
    }

    pub(crate) fn timers_mut(&mut self) -> &mut [Timer; TIMER_COUNT] {
        &mut self.timers
    }
}
