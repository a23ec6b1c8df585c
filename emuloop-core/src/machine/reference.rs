//! Reference machine
//!
//! A small, fully deterministic machine wired to a [`Coordinator`]: an
//! eight-register pseudo CPU executing a seeded program out of RAM, a
//! scanline counter that raises HBlank/VBlank/VCounter and arms DMA, one
//! audio sample per line, and a framebuffer filled line by line. It stands in
//! for a real console core in the runner and in the controller tests.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{need, MachineCore, MachineError, MachineResult, StepOutcome};
use crate::timing::{
    self, Coordinator, DmaControl, DmaTiming, Irq, IrqSet, Prescaler, TimerControl,
};

pub const RAM_SIZE: usize = 0x4000;
const PROGRAM_SIZE: usize = 0x1000;
const DATA_BASE: usize = 0x1000;
const DATA_SIZE: usize = 0x2000;
const VRAM_BASE: usize = 0x3000;
const VECTOR_BASE: usize = 0x0F00;
const STATE_MAGIC: u32 = 0x504C_4D45; // "EMLP"

/// Halt opcode; every other `xxxxx101` is a no-op
const OP_HALT: u8 = 0xFD;

/// Video geometry and clocking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceConfig {
    pub cycles_per_line: u32,
    pub visible_lines: u32,
    pub total_lines: u32,
    /// Framebuffer bytes per line
    pub line_width: usize,
    /// Line that raises VCounter
    pub vcount: u32,
    pub seed: u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            cycles_per_line: 1232,
            visible_lines: 160,
            total_lines: 228,
            line_width: 64,
            vcount: 100,
            seed: 0x0123_4567_89AB_CDEF,
        }
    }
}

impl ReferenceConfig {
    /// Tiny frames for tests
    pub fn small() -> Self {
        Self {
            cycles_per_line: 96,
            visible_lines: 12,
            total_lines: 16,
            line_width: 16,
            vcount: 8,
            seed: 0x0123_4567_89AB_CDEF,
        }
    }

    pub fn cycles_per_frame(&self) -> u64 {
        self.cycles_per_line as u64 * self.total_lines as u64
    }
}

pub struct ReferenceMachine {
    config: ReferenceConfig,
    regs: [u32; 8],
    pc: usize,
    ram: Vec<u8>,
    framebuffer: Vec<u8>,
    timing: Coordinator,
    line: u32,
    line_cycles: u32,
    frame: u64,
    serviced: u64,
    audio: Vec<i16>,
    fault_at_frame: Option<u64>,
}

impl ReferenceMachine {
    pub fn new(config: ReferenceConfig) -> Self {
        let mut machine = Self {
            config,
            regs: [0; 8],
            pc: 0,
            ram: vec![0; RAM_SIZE],
            framebuffer: vec![0; config.line_width * config.visible_lines as usize],
            timing: Coordinator::new(),
            line: 0,
            line_cycles: 0,
            frame: 0,
            serviced: 0,
            audio: Vec::new(),
            fault_at_frame: None,
        };
        machine.power_on();
        machine
    }

    fn power_on(&mut self) {
        let mut seed = self.config.seed | 1;
        for byte in self.ram.iter_mut() {
            // xorshift64
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            *byte = seed as u8;
        }
        self.regs = [0; 8];
        self.pc = 0;
        self.framebuffer.fill(0);
        self.line = 0;
        self.line_cycles = 0;
        self.frame = 0;
        self.serviced = 0;
        self.audio.clear();

        self.timing.reset();
        self.timing.irq.write_ie(
            (IrqSet::VBLANK | IrqSet::TIMER0 | IrqSet::DMA0 | IrqSet::KEYPAD).bits(),
        );
        self.timing.irq.write_ime(1);
        self.timing.timers.write_reload(0, 0x00FF);
        self.timing.timers.write_control(
            0,
            TimerControl {
                enabled: true,
                prescaler: Prescaler::Div64,
                cascade: false,
                irq_enable: true,
            },
        );
        self.timing
            .dma
            .write_channel(0, DATA_BASE as u32, VRAM_BASE as u32, self.config.line_width as u32);
        self.timing.dma.write_control(
            0,
            DmaControl {
                enabled: true,
                timing: DmaTiming::HBlank,
                repeat: true,
                irq_enable: false,
            },
        );
    }

    /// Make `run_loop` fail once `frame` frames have completed
    pub fn set_fault_at_frame(&mut self, frame: Option<u64>) {
        self.fault_at_frame = frame;
    }

    /// Enter stop mode (only keypad, game pak or serial wake it)
    pub fn stop(&mut self) {
        self.timing.stop();
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    pub fn registers(&self) -> &[u32; 8] {
        &self.regs
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn timing(&self) -> &Coordinator {
        &self.timing
    }

    pub fn timing_mut(&mut self) -> &mut Coordinator {
        &mut self.timing
    }

    /// Interrupts taken since reset
    pub fn serviced_interrupts(&self) -> u64 {
        self.serviced
    }

    fn fetch(&mut self) -> u8 {
        let op = self.ram[self.pc];
        self.pc = (self.pc + 1) % PROGRAM_SIZE;
        op
    }

    /// Run any armed DMA; called on every memory access
    fn service_dma(&mut self) -> u32 {
        let Some(transfer) = self.timing.check_dma() else {
            return 0;
        };
        for offset in 0..transfer.count as usize {
            let src = (transfer.source as usize + offset) % RAM_SIZE;
            let dst = (transfer.dest as usize + offset) % RAM_SIZE;
            self.ram[dst] = self.ram[src];
        }
        self.timing.complete_dma(transfer.channel);
        transfer.count
    }

    /// Execute one instruction (or take one interrupt); returns cycles used
    fn step(&mut self) -> u32 {
        if let Some(irq) = self.timing.next_dispatch() {
            self.timing.acknowledge(irq.mask());
            self.regs[7] = self.pc as u32;
            self.pc = VECTOR_BASE + irq as usize * 4;
            self.serviced += 1;
            return 3;
        }

        let op = self.fetch();
        let a = ((op >> 3) & 7) as usize;
        let b = ((op >> 5) & 7) as usize;
        match op & 7 {
            0 => {
                self.regs[a] = self.regs[a].wrapping_add(self.regs[b]).wrapping_add(op as u32);
                1
            }
            1 => {
                self.regs[a] ^= self.regs[b].rotate_left((op >> 3) as u32);
                1
            }
            2 => {
                self.regs[a] = self.ram[self.regs[b] as usize % RAM_SIZE] as u32;
                3 + self.service_dma()
            }
            3 => {
                self.ram[DATA_BASE + self.regs[b] as usize % DATA_SIZE] = self.regs[a] as u8;
                3 + self.service_dma()
            }
            4 => {
                self.regs[a] = self.regs[a].wrapping_mul(0x9E37_79B1) ^ self.regs[b];
                2
            }
            5 if op == OP_HALT => {
                self.timing.halt();
                1
            }
            5 => 1,
            6 => {
                self.regs[a] = self.regs[a].wrapping_sub(self.regs[b]);
                1
            }
            _ => {
                if self.regs[a] & 1 == 0 {
                    self.pc = self.regs[b] as usize % PROGRAM_SIZE;
                }
                2
            }
        }
    }

    fn end_line(&mut self) -> StepOutcome {
        let line = self.line;
        if line < self.config.visible_lines {
            let width = self.config.line_width;
            let start = line as usize * width;
            let src = VRAM_BASE + (start % (RAM_SIZE - VRAM_BASE));
            for x in 0..width {
                self.framebuffer[start + x] = self.ram[(src + x) % RAM_SIZE];
            }
            self.timing.raise(Irq::HBlank);
            self.timing.video_event(DmaTiming::HBlank);
        }
        self.audio.push((self.regs[0] ^ line) as i16);

        self.line += 1;
        self.line_cycles = 0;
        if self.line == self.config.visible_lines {
            self.timing.raise(Irq::VBlank);
            self.timing.video_event(DmaTiming::VBlank);
        }
        if self.line == self.config.vcount {
            self.timing.raise(Irq::VCounter);
        }
        if self.line >= self.config.total_lines {
            self.line = 0;
            self.frame += 1;
            return StepOutcome::FrameComplete;
        }
        StepOutcome::Continue
    }
}

impl Default for ReferenceMachine {
    fn default() -> Self {
        Self::new(ReferenceConfig::default())
    }
}

impl MachineCore for ReferenceMachine {
    /// Runs one scanline
    fn run_loop(&mut self) -> MachineResult<StepOutcome> {
        if self.fault_at_frame == Some(self.frame) {
            return Err(MachineError::Fault(format!(
                "injected fault at frame {}",
                self.frame
            )));
        }

        while self.line_cycles < self.config.cycles_per_line {
            let remaining = (self.config.cycles_per_line - self.line_cycles) as u64;
            let cycles = if self.timing.try_wake() {
                self.step() as u64
            } else if self.timing.irq.power() == timing::PowerState::Stopped {
                return Ok(StepOutcome::Halted);
            } else {
                // Halted: skip ahead to the next timer event or the line end
                self.timing
                    .cycles_until_next_event()
                    .unwrap_or(remaining)
                    .clamp(1, remaining)
            };
            self.timing.tick(cycles);
            self.line_cycles = self
                .line_cycles
                .saturating_add(cycles.min(u32::MAX as u64) as u32);
        }
        Ok(self.end_line())
    }

    fn reset(&mut self) {
        self.power_on();
    }

    fn raise_interrupt(&mut self, irq: Irq) {
        self.timing.raise(irq);
    }

    fn pending_interrupts(&self) -> IrqSet {
        self.timing.pending()
    }

    fn clear_interrupts(&mut self, lines: IrqSet) {
        self.timing.acknowledge(lines);
    }

    fn snapshot(&self) -> MachineResult<Bytes> {
        let mut buf = BytesMut::with_capacity(
            64 + timing::STATE_SIZE + self.ram.len() + self.framebuffer.len(),
        );
        buf.put_u32_le(STATE_MAGIC);
        for reg in self.regs {
            buf.put_u32_le(reg);
        }
        buf.put_u32_le(self.pc as u32);
        buf.put_u32_le(self.line);
        buf.put_u32_le(self.line_cycles);
        buf.put_u64_le(self.frame);
        buf.put_u64_le(self.serviced);
        self.timing.save(&mut buf);
        buf.put_u32_le(self.framebuffer.len() as u32);
        buf.put_slice(&self.framebuffer);
        buf.put_slice(&self.ram);
        Ok(buf.freeze())
    }

    fn restore(&mut self, state: &[u8]) -> MachineResult<()> {
        let mut buf = state;
        need(&buf, 4 + 32 + 12 + 16)?;
        if buf.get_u32_le() != STATE_MAGIC {
            return Err(MachineError::InvalidState("bad state magic".into()));
        }
        let mut regs = [0u32; 8];
        for reg in regs.iter_mut() {
            *reg = buf.get_u32_le();
        }
        let pc = buf.get_u32_le() as usize;
        let line = buf.get_u32_le();
        let line_cycles = buf.get_u32_le();
        let frame = buf.get_u64_le();
        let serviced = buf.get_u64_le();
        if pc >= PROGRAM_SIZE || line >= self.config.total_lines {
            return Err(MachineError::InvalidState(format!(
                "pc {:#x} / line {} out of range",
                pc, line
            )));
        }

        let mut timing = Coordinator::new();
        timing.load(&mut buf)?;

        need(&buf, 4)?;
        let fb_len = buf.get_u32_le() as usize;
        if fb_len != self.framebuffer.len() {
            return Err(MachineError::InvalidState(format!(
                "framebuffer size {} does not match {}",
                fb_len,
                self.framebuffer.len()
            )));
        }
        need(&buf, fb_len + RAM_SIZE)?;

        // Everything validated; commit
        self.regs = regs;
        self.pc = pc;
        self.line = line;
        self.line_cycles = line_cycles;
        self.frame = frame;
        self.serviced = serviced;
        self.timing = timing;
        buf.copy_to_slice(&mut self.framebuffer);
        buf.copy_to_slice(&mut self.ram);
        Ok(())
    }

    fn is_halted(&self) -> bool {
        self.timing.is_halted()
    }

    fn video_frame(&self) -> Bytes {
        Bytes::copy_from_slice(&self.framebuffer)
    }

    fn drain_audio(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.audio)
    }
}
