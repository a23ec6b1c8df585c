//! Interrupt/timing coordination
//!
//! The [`Coordinator`] bundles the interrupt controller, the countdown
//! timers and the DMA channels behind one master clock. It belongs to the
//! machine core and is only ever touched by the execution thread, or by the
//! owning caller inside a confirmed interrupt window; it has no locking of
//! its own.

pub mod dma;
pub mod irq;
pub mod timer;

pub use dma::{Dma, DmaControl, DmaTiming, DmaTransfer};
pub use irq::{InterruptController, Irq, IrqSet, PowerState};
pub use timer::{Prescaler, TimerControl, Timers};

use bytes::{Buf, BufMut, BytesMut};

use crate::machine::{need, MachineError, MachineResult};

/// Serialized size of a [`Coordinator`]
pub const STATE_SIZE: usize = 8 + 8 + 6 + timer::TIMER_COUNT * 13 + dma::DMA_CHANNELS * 14 + 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coordinator {
    pub irq: InterruptController,
    pub timers: Timers,
    pub dma: Dma,
    cycles: u64,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Master cycles since reset
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Advance the master clock
    pub fn tick(&mut self, cycles: u64) {
        self.cycles += cycles;
        self.timers.tick(cycles, &mut self.irq);
    }

    pub fn raise(&mut self, irq: Irq) -> bool {
        self.irq.raise(irq)
    }

    pub fn pending(&self) -> IrqSet {
        self.irq.pending()
    }

    pub fn acknowledge(&mut self, lines: IrqSet) {
        self.irq.acknowledge(lines);
    }

    /// Tested by the CPU before dispatching each instruction
    pub fn next_dispatch(&self) -> Option<Irq> {
        self.irq.next_dispatch()
    }

    /// Video event: arms DMA channels waiting on it
    pub fn video_event(&mut self, timing: DmaTiming) {
        self.dma.on_event(timing);
    }

    /// Memory-access hook
    pub fn check_dma(&self) -> Option<DmaTransfer> {
        self.dma.check_on_access()
    }

    pub fn complete_dma(&mut self, channel: usize) {
        self.dma.complete(channel, &mut self.irq);
    }

    pub fn halt(&mut self) {
        self.irq.halt();
    }

    pub fn stop(&mut self) {
        self.irq.stop();
    }

    pub fn is_halted(&self) -> bool {
        self.irq.power() != PowerState::Running
    }

    /// Leave the low-power state if a qualifying interrupt or DMA is due.
    /// Returns true when the CPU is (now) running.
    pub fn try_wake(&mut self) -> bool {
        let power = self.irq.power();
        let dma_due = power == PowerState::Halted && self.dma.any_armed();
        if power == PowerState::Running || self.irq.wake_requested() || dma_due {
            self.irq.wake();
            return true;
        }
        false
    }

    /// Cycles a halted CPU can skip before something happens
    pub fn cycles_until_next_event(&self) -> Option<u64> {
        self.timers.cycles_until_next_event()
    }

    pub fn save(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.cycles);
        buf.put_u64_le(self.irq.raised_count());
        buf.put_u16_le(self.irq.enabled().bits());
        buf.put_u16_le(self.irq.pending().bits());
        buf.put_u8(self.irq.master_enable() as u8);
        buf.put_u8(self.irq.power().to_u8());

        for timer in self.timers.timers() {
            let control = timer.control;
            buf.put_u16_le(timer.reload);
            buf.put_u16_le(timer.counter);
            buf.put_u8(
                control.enabled as u8
                    | (control.cascade as u8) << 1
                    | (control.irq_enable as u8) << 2
                    | control.prescaler.to_u8() << 4,
            );
            buf.put_u64_le(timer.remainder);
        }

        for channel in self.dma.channels() {
            let control = channel.control;
            buf.put_u32_le(channel.source);
            buf.put_u32_le(channel.dest);
            buf.put_u32_le(channel.count);
            buf.put_u8(
                control.enabled as u8
                    | (control.repeat as u8) << 1
                    | (control.irq_enable as u8) << 2
                    | control.timing.to_u8() << 4,
            );
            buf.put_u8(channel.armed as u8);
        }
        buf.put_u64_le(self.dma.completed());
    }

    pub fn load(&mut self, buf: &mut &[u8]) -> MachineResult<()> {
        need(buf, STATE_SIZE)?;
        let mut restored = Coordinator::new();

        restored.cycles = buf.get_u64_le();
        let raised = buf.get_u64_le();
        let enabled = buf.get_u16_le();
        let pending = buf.get_u16_le();
        let ime = buf.get_u8() != 0;
        let power = PowerState::from_u8(buf.get_u8())
            .ok_or_else(|| MachineError::InvalidState("bad power state".into()))?;
        restored.irq.restore_raw(enabled, pending, ime, power, raised);

        for timer in restored.timers.timers_mut().iter_mut() {
            timer.reload = buf.get_u16_le();
            timer.counter = buf.get_u16_le();
            let bits = buf.get_u8();
            timer.control = TimerControl {
                enabled: bits & 1 != 0,
                cascade: bits & 2 != 0,
                irq_enable: bits & 4 != 0,
                prescaler: Prescaler::from_u8(bits >> 4),
            };
            timer.remainder = buf.get_u64_le();
        }

        for channel in restored.dma.channels_mut().iter_mut() {
            channel.source = buf.get_u32_le();
            channel.dest = buf.get_u32_le();
            channel.count = buf.get_u32_le();
            let bits = buf.get_u8();
            channel.control = DmaControl {
                enabled: bits & 1 != 0,
                repeat: bits & 2 != 0,
                irq_enable: bits & 4 != 0,
                timing: DmaTiming::from_u8(bits >> 4),
            };
            channel.armed = buf.get_u8() != 0;
        }
        restored.dma.set_completed(buf.get_u64_le());

        *self = restored;
        Ok(())
    }
}
