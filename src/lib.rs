//! A CHIP-8 virtual machine core.
//!
//! The CHIP-8 is a small interpreted architecture from the late 1970s:
//! 4096 bytes of memory, 16 8-bit registers (VF doubling as the
//! carry/borrow/collision flag), a 16-bit index register, a 16-slot return
//! stack, a 64x32 monochrome display drawn by XOR-ing sprites, two 8-bit
//! countdown timers ticking at 60 Hz, and a 16-key hexadecimal keypad.
//!
//! This crate is only the machine: an external driver owns the render loop
//! and calls [`Machine::step`] at whatever instruction rate it likes, while
//! the timers count down on their own 60 Hz thread. Input arrives through
//! the [`Keyboard`] capability the machine is constructed with; the machine
//! queries it but never implements or disposes it. One instruction (`Fx0A`)
//! suspends the `step` call until that capability delivers a key.
//!
//! ```no_run
//! use std::sync::Arc;
//! # use std::sync::mpsc;
//! # use ocho::{Key, Keyboard};
//! # struct Pad;
//! # impl Keyboard for Pad {
//! #     fn pressed_key(&self) -> Option<Key> { None }
//! #     fn next_key_press(&self) -> mpsc::Receiver<Key> { mpsc::channel().1 }
//! # }
//! let keyboard: Arc<dyn Keyboard> = Arc::new(Pad);
//! let mut machine = ocho::Machine::new(keyboard, None);
//! machine.load_program(&[0x00, 0xE0]).unwrap();
//!
//! let op = machine.step().unwrap();
//! if op.is_display_op() {
//!     let pixels = machine.display();
//!     // hand the 64x32 snapshot to the renderer
//! }
//! machine.dispose();
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, info, o, trace, Logger};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use thiserror::Error;

mod graphics;
mod keyboard;
mod op;
mod timer;


pub use crate::graphics::{HEIGHT, WIDTH};
pub use crate::keyboard::{Key, Keyboard, MultiKeyboard};
pub use crate::op::Op;

use crate::graphics::Graphics;
use crate::timer::{Ticker, Timers};

/// Total addressable memory, in bytes.
pub const MEMORY_SIZE: usize = 0x1000;

/// Address where program bytes are loaded; everything below belongs to the
/// interpreter (the glyph sprites live at 0x000..0x050).
pub const PROGRAM_START: usize = 0x200;

const NUM_REGISTERS: usize = 16;
const STACK_SIZE: usize = 16;
const GLYPH_BYTES: u16 = 5;

/// How often a suspended `Fx0A` wait wakes up to check for disposal.
const KEY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The 16 5-byte glyph sprites for hex digits 0-F, written to low memory at
/// construction so `Fx29` can point `I` at any digit's bitmap.
const GLYPH_SPRITES: [u8; 80] = [
    0xF0, 0x90, 0x90, 0x90, 0xF0, // 0
    0x20, 0x60, 0x20, 0x20, 0x70, // 1
    0xF0, 0x10, 0xF0, 0x80, 0xF0, // 2
    0xF0, 0x10, 0xF0, 0x10, 0xF0, // 3
    0x90, 0x90, 0xF0, 0x10, 0x10, // 4
    0xF0, 0x80, 0xF0, 0x10, 0xF0, // 5
    0xF0, 0x80, 0xF0, 0x90, 0xF0, // 6
    0xF0, 0x10, 0x20, 0x40, 0x40, // 7
    0xF0, 0x90, 0xF0, 0x90, 0xF0, // 8
    0xF0, 0x90, 0xF0, 0x10, 0xF0, // 9
    0xF0, 0x90, 0xF0, 0x90, 0x90, // A
    0xE0, 0x90, 0xE0, 0x90, 0xE0, // B
    0xF0, 0x80, 0x80, 0x80, 0xF0, // C
    0xE0, 0x90, 0x90, 0x90, 0xE0, // D
    0xF0, 0x80, 0xF0, 0x80, 0xF0, // E
    0xF0, 0x80, 0xF0, 0x80, 0x80, // F
];

/// Ways a call into the machine can fail. Undefined instruction encodings
/// are deliberately not among them: the hardware tolerated those, so the
/// machine executes them as no-ops.
#[derive(Debug, Error)]
pub enum Error {
    /// `step` was called after `dispose`; the machine is permanently halted.
    #[error("the machine has been disposed and can no longer execute")]
    Disposed,
    /// The program counter left addressable memory, which means a malformed
    /// program or a jump into nowhere. Not recovered.
    #[error("program counter {0:#06X} is outside addressable memory")]
    PcOutOfBounds(u16),
    /// The program blob does not fit between `PROGRAM_START` and the end of
    /// memory.
    #[error("program of {0} bytes does not fit in {capacity} bytes of program memory", capacity = MEMORY_SIZE - PROGRAM_START)]
    ProgramTooLarge(usize),
    /// The keyboard capability dropped its end of a key wait without
    /// delivering a key.
    #[error("the keyboard capability shut down while a key press was awaited")]
    KeyboardClosed,
}

/// The CHIP-8 machine: memory, registers, stack, framebuffer and timers,
/// plus a shared handle to the keyboard capability it consumes but never
/// owns the lifecycle of.
///
/// Drive it by calling [`step`](Machine::step) in a loop; serialize those
/// calls yourself, the machine does no internal locking. The only
/// concurrent activity is the timer ticker, which touches nothing but the
/// two timer registers. The lifecycle is one-way: Running until
/// [`dispose`](Machine::dispose), then permanently Disposed.
pub struct Machine {
    memory: [u8; MEMORY_SIZE],

    // V0-VF. Several instructions overwrite VF as their carry, borrow or
    // collision flag.
    v: [u8; NUM_REGISTERS],
    i: u16,
    pc: u16,

    // return stack; sp == -1 is the empty sentinel, pointing below the floor
    stack: [u16; STACK_SIZE],
    sp: i16,

    graphics: Graphics,
    timers: Arc<Timers>,
    ticker: Option<Ticker>,
    keyboard: Arc<dyn Keyboard>,
    disposed: Arc<AtomicBool>,
    logger: Logger,
}

impl Machine {
    /// Build a machine wired to the given keyboard capability: glyph sprites
    /// in low memory, everything else zeroed, `PC` at [`PROGRAM_START`], and
    /// the 60 Hz timer ticker already running.
    ///
    /// Pass `None` to log to the terminal, or supply a [`Logger`] to direct
    /// the logs somewhere else.
    pub fn new(keyboard: Arc<dyn Keyboard>, logger: Option<Logger>) -> Self {
        let logger = logger.unwrap_or_else(default_logger);

        let mut memory = [0u8; MEMORY_SIZE];
        memory[..GLYPH_SPRITES.len()].copy_from_slice(&GLYPH_SPRITES);

        let timers = Arc::new(Timers::default());
        let ticker = Ticker::start(Arc::clone(&timers));

        debug!(logger, "machine initialized"; "timer_hz" => timer::TIMER_HZ);

        Machine {
            memory,
            v: [0; NUM_REGISTERS],
            i: 0,
            pc: PROGRAM_START as u16,
            stack: [0; STACK_SIZE],
            sp: -1,
            graphics: Graphics::new(),
            timers,
            ticker: Some(ticker),
            keyboard,
            disposed: Arc::new(AtomicBool::new(false)),
            logger,
        }
    }

    /// Copy a program into memory at [`PROGRAM_START`]. Registers, timers
    /// and the program counter are left alone, so this is only good for
    /// loading before the first [`step`](Machine::step).
    pub fn load_program(&mut self, program: &[u8]) -> Result<(), Error> {
        if program.len() > MEMORY_SIZE - PROGRAM_START {
            return Err(Error::ProgramTooLarge(program.len()));
        }
        self.memory[PROGRAM_START..PROGRAM_START + program.len()].copy_from_slice(program);
        info!(self.logger, "program loaded"; "bytes" => program.len());
        Ok(())
    }

    /// Fetch, decode and execute the instruction at `PC`, returning which
    /// instruction ran so the driver can react (e.g. redraw after a display
    /// op).
    ///
    /// The program counter is advanced past the instruction word before
    /// dispatch, so jumps and calls land exactly where they aim. On `Fx0A`
    /// this call suspends until the keyboard capability delivers a key, the
    /// capability shuts down, or the machine is disposed.
    pub fn step(&mut self) -> Result<Op, Error> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        if self.pc as usize > MEMORY_SIZE - 2 {
            return Err(Error::PcOutOfBounds(self.pc));
        }

        let word = self.read_word(self.pc);
        let op = Op::from(word);
        trace!(self.logger, "step"; "pc" => self.pc, "op" => ?op);

        self.pc += 2;
        self.execute(op)?;
        Ok(op)
    }

    /// A snapshot of the framebuffer: [`WIDTH`] x [`HEIGHT`] pixel states,
    /// row-major.
    pub fn display(&self) -> Vec<bool> {
        self.graphics.pixels()
    }

    /// Current value of the delay timer.
    pub fn delay_timer(&self) -> u8 {
        self.timers.delay()
    }

    /// Current value of the sound timer. A shell that wants audio beeps
    /// while this is nonzero.
    pub fn sound_timer(&self) -> u8 {
        self.timers.sound()
    }

    /// Walk every memory cell as an `(address, byte)` pair, glyph area and
    /// program alike.
    pub fn memory_dump(&self) -> impl Iterator<Item = (usize, u8)> + '_ {
        self.memory.iter().copied().enumerate()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Halt the machine for good: stop and join the timer ticker and mark
    /// the machine disposed, after which every `step` fails with
    /// [`Error::Disposed`] (including a step currently suspended on `Fx0A`,
    /// which observes the flag and gives up its wait). Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(self.logger, "machine disposed");
        drop(self.ticker.take());
    }

    /// Run one decoded instruction against the machine state.
    fn execute(&mut self, op: Op) -> Result<(), Error> {
        let x = op_x(op) as usize;

        match op {
            // tolerated and ignored, like the hardware did
            Op::Sys(_) | Op::Nop(_) => {}

            Op::Cls => self.graphics.clear(),
            Op::Ret => {
                if self.sp >= 0 {
                    self.pc = self.stack[self.sp as usize % STACK_SIZE];
                    self.sp -= 1;
                }
            }
            Op::Jp(nnn) => self.pc = nnn,
            Op::Call(nnn) => {
                self.sp = self.sp.wrapping_add(1);
                self.stack[self.sp as usize % STACK_SIZE] = self.pc;
                self.pc = nnn;
            }
            Op::SeByte(_, kk) => {
                if self.v[x] == kk {
                    self.skip_next();
                }
            }
            Op::SneByte(_, kk) => {
                if self.v[x] != kk {
                    self.skip_next();
                }
            }
            Op::SeReg(_, y) => {
                if self.v[x] == self.v[y as usize] {
                    self.skip_next();
                }
            }
            Op::LdByte(_, kk) => self.v[x] = kk,
            Op::AddByte(_, kk) => self.v[x] = self.v[x].wrapping_add(kk),
            Op::LdReg(_, y) => self.v[x] = self.v[y as usize],
            Op::Or(_, y) => self.v[x] |= self.v[y as usize],
            Op::And(_, y) => self.v[x] &= self.v[y as usize],
            Op::Xor(_, y) => self.v[x] ^= self.v[y as usize],
            Op::AddReg(_, y) => {
                let (sum, carried) = self.v[x].overflowing_add(self.v[y as usize]);
                self.v[x] = sum;
                self.v[0xF] = carried as u8;
            }
            Op::Sub(_, y) => {
                let no_borrow = self.v[x] >= self.v[y as usize];
                self.v[x] = self.v[x].wrapping_sub(self.v[y as usize]);
                self.v[0xF] = no_borrow as u8;
            }
            Op::Shr(_) => {
                let shifted_out = self.v[x] & 0x1;
                self.v[x] >>= 1;
                self.v[0xF] = shifted_out;
            }
            Op::Subn(_, y) => {
                let no_borrow = self.v[y as usize] >= self.v[x];
                self.v[x] = self.v[y as usize].wrapping_sub(self.v[x]);
                self.v[0xF] = no_borrow as u8;
            }
            Op::Shl(_) => {
                let shifted_out = self.v[x] >> 7;
                self.v[x] <<= 1;
                self.v[0xF] = shifted_out;
            }
            Op::SneReg(_, y) => {
                if self.v[x] != self.v[y as usize] {
                    self.skip_next();
                }
            }
            Op::LdI(nnn) => self.i = nnn,
            Op::JpV0(nnn) => self.pc = nnn.wrapping_add(self.v[0] as u16),
            Op::Rnd(_, kk) => self.v[x] = rand::random::<u8>() & kk,
            Op::Drw(_, y, n) => {
                let rows: Vec<u8> = (0..n as usize)
                    .map(|row| self.read_byte(self.i as usize + row))
                    .collect();
                let collided = self.graphics.draw_sprite(self.v[x], self.v[y as usize], &rows);
                self.v[0xF] = collided as u8;
            }
            Op::Skp(_) => {
                if self.pressed_key_code() == Some(self.v[x]) {
                    self.skip_next();
                }
            }
            Op::Sknp(_) => {
                if self.pressed_key_code() != Some(self.v[x]) {
                    self.skip_next();
                }
            }
            Op::LdDt(_) => self.v[x] = self.timers.delay(),
            Op::WaitKey(_) => {
                let key = self.wait_for_key()?;
                self.v[x] = key.code();
            }
            Op::SetDt(_) => self.timers.set_delay(self.v[x]),
            Op::SetSt(_) => self.timers.set_sound(self.v[x]),
            Op::AddI(_) => self.i = self.i.wrapping_add(self.v[x] as u16),
            Op::LdGlyph(_) => self.i = self.v[x] as u16 * GLYPH_BYTES,
            Op::Bcd(_) => {
                let value = self.v[x];
                self.write_byte(self.i as usize, value / 100);
                self.write_byte(self.i as usize + 1, value / 10 % 10);
                self.write_byte(self.i as usize + 2, value % 10);
            }
            Op::Store(_) => {
                for offset in 0..=x {
                    self.write_byte(self.i as usize + offset, self.v[offset]);
                }
            }
            Op::Load(_) => {
                for offset in 0..=x {
                    self.v[offset] = self.read_byte(self.i as usize + offset);
                }
            }
        }
        Ok(())
    }

    /// Suspend until the keyboard capability delivers a key. The wait is a
    /// fresh one-shot per `Fx0A`; between short blocks it re-checks the
    /// disposed flag so disposal cancels the suspension instead of leaving
    /// the caller hung.
    fn wait_for_key(&self) -> Result<Key, Error> {
        debug!(self.logger, "suspended awaiting key press");
        let pressed = self.keyboard.next_key_press();
        loop {
            if self.is_disposed() {
                return Err(Error::Disposed);
            }
            match pressed.recv_timeout(KEY_POLL_INTERVAL) {
                Ok(key) => {
                    debug!(self.logger, "key press resumed execution"; "key" => ?key);
                    return Ok(key);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::KeyboardClosed),
            }
        }
    }

    fn pressed_key_code(&self) -> Option<u8> {
        self.keyboard.pressed_key().map(Key::code)
    }

    /// Skip over the next instruction word, as the conditional-skip family
    /// does.
    fn skip_next(&mut self) {
        self.pc = self.pc.wrapping_add(2);
    }

    /// Big-endian 16-bit read; the caller guarantees `addr + 1` is in
    /// bounds.
    fn read_word(&self, addr: u16) -> u16 {
        let msb = self.memory[addr as usize];
        let lsb = self.memory[addr as usize + 1];
        (msb as u16) << 8 | lsb as u16
    }

    /// Byte access for `I`-relative operations. `I` arithmetic can push
    /// addresses past the top of memory; those wrap around the 4 KiB space
    /// instead of faulting.
    fn read_byte(&self, addr: usize) -> u8 {
        self.memory[addr % MEMORY_SIZE]
    }

    fn write_byte(&mut self, addr: usize, value: u8) {
        self.memory[addr % MEMORY_SIZE] = value;
    }
}

/// The register index nibble of an op, 0 for the ops that carry none.
fn op_x(op: Op) -> u8 {
    match op {
        Op::SeByte(x, _)
        | Op::SneByte(x, _)
        | Op::SeReg(x, _)
        | Op::LdByte(x, _)
        | Op::AddByte(x, _)
        | Op::LdReg(x, _)
        | Op::Or(x, _)
        | Op::And(x, _)
        | Op::Xor(x, _)
        | Op::AddReg(x, _)
        | Op::Sub(x, _)
        | Op::Shr(x)
        | Op::Subn(x, _)
        | Op::Shl(x)
        | Op::SneReg(x, _)
        | Op::Rnd(x, _)
        | Op::Drw(x, _, _)
        | Op::Skp(x)
        | Op::Sknp(x)
        | Op::LdDt(x)
        | Op::WaitKey(x)
        | Op::SetDt(x)
        | Op::SetSt(x)
        | Op::AddI(x)
        | Op::LdGlyph(x)
        | Op::Bcd(x)
        | Op::Store(x)
        | Op::Load(x) => x,
        _ => 0,
    }
}

/// Terminal logger used when the caller does not supply one.
fn default_logger() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Info);
    builder.destination(Destination::Stderr);
    builder
        .build()
        .unwrap_or_else(|_| Logger::root(slog::Discard, o!()))
}
