//! Desktop driver for the machine: a minifb window renders the framebuffer
//! and feeds the keyboard capability from its own key state.
//!
//! Run with a ROM path (`cargo run --example play -- games/PONG.ch8`) or
//! with no arguments to watch a small built-in program cycle the hex digits.
//!
//! The machine runs on a worker thread so that a program suspended on the
//! wait-for-key instruction cannot stall the window loop that produces key
//! presses in the first place.
use std::env;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use minifb::{Key as WindowKey, ScaleMode, Window, WindowOptions};

use ocho::{Key, Keyboard, Machine, HEIGHT, WIDTH};

/// ~500 instructions per second, the usual CHIP-8 pace.
const STEP_INTERVAL: Duration = Duration::from_millis(2);

const LIT: u32 = 0x00FF_FFFF;
const DARK: u32 = 0x0000_0000;

/// Fallback program: clear, draw the current hex digit in the middle of the
/// screen, pace on the delay timer, next digit, repeat.
const DIGIT_LOOP: &[u8] = &[
    0x60, 0x00, // V0 = 0
    0x00, 0xE0, // clear
    0xF0, 0x29, // I = glyph(V0)
    0x6A, 0x1C, // VA = 28
    0x6B, 0x0D, // VB = 13
    0xDA, 0xB5, // draw 5 rows at (VA, VB)
    0x6C, 0x0A, // VC = 10
    0xFC, 0x15, // DT = VC
    0xFC, 0x07, // VC = DT
    0x3C, 0x00, // skip if VC == 0
    0x12, 0x10, // else re-read DT
    0x70, 0x01, // V0 += 1
    0x40, 0x10, // skip if V0 != 0x10
    0x60, 0x00, // V0 = 0
    0x12, 0x02, // back to clear
];

struct PadState {
    pressed: Option<Key>,
    waiters: Vec<mpsc::Sender<Key>>,
    closed: bool,
}

/// Keyboard capability backed by the window's key state, refreshed once per
/// frame by the window loop.
struct WindowPad(Mutex<PadState>);

impl WindowPad {
    fn new() -> Arc<Self> {
        Arc::new(WindowPad(Mutex::new(PadState {
            pressed: None,
            waiters: Vec::new(),
            closed: false,
        })))
    }

    /// Record which keypad key the window currently reports down, resolving
    /// outstanding key waits on a fresh press.
    fn refresh(&self, keys_down: &[WindowKey]) {
        let mapped = keys_down.iter().find_map(|&key| map_key(key));
        let mut state = self.0.lock().unwrap();
        if let Some(key) = mapped {
            if state.pressed != Some(key) {
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(key);
                }
            }
        }
        state.pressed = mapped;
    }

    /// Stop serving input: outstanding and future waits report the
    /// capability as shut down, unblocking a machine suspended on Fx0A.
    fn shutdown(&self) {
        let mut state = self.0.lock().unwrap();
        state.closed = true;
        state.waiters.clear();
    }
}

impl Keyboard for WindowPad {
    fn pressed_key(&self) -> Option<Key> {
        self.0.lock().unwrap().pressed
    }

    fn next_key_press(&self) -> mpsc::Receiver<Key> {
        let (tx, rx) = mpsc::channel();
        let mut state = self.0.lock().unwrap();
        if !state.closed {
            state.waiters.push(tx);
        }
        rx
    }
}

/// The recommended mapping from the host keyboard to the CHIP-8 keypad:
///
/// ```text
/// Keypad                   Keyboard
/// +-+-+-+-+                +-+-+-+-+
/// |1|2|3|C|                |1|2|3|4|
/// +-+-+-+-+                +-+-+-+-+
/// |4|5|6|D|                |Q|W|E|R|
/// +-+-+-+-+       =>       +-+-+-+-+
/// |7|8|9|E|                |A|S|D|F|
/// +-+-+-+-+                +-+-+-+-+
/// |A|0|B|F|                |Z|X|C|V|
/// +-+-+-+-+                +-+-+-+-+
/// ```
fn map_key(key: WindowKey) -> Option<Key> {
    match key {
        WindowKey::Key1 => Some(Key::Key1),
        WindowKey::Key2 => Some(Key::Key2),
        WindowKey::Key3 => Some(Key::Key3),
        WindowKey::Key4 => Some(Key::C),
        WindowKey::Q => Some(Key::Key4),
        WindowKey::W => Some(Key::Key5),
        WindowKey::E => Some(Key::Key6),
        WindowKey::R => Some(Key::D),
        WindowKey::A => Some(Key::Key7),
        WindowKey::S => Some(Key::Key8),
        WindowKey::D => Some(Key::Key9),
        WindowKey::F => Some(Key::E),
        WindowKey::Z => Some(Key::A),
        WindowKey::X => Some(Key::Key0),
        WindowKey::C => Some(Key::B),
        WindowKey::V => Some(Key::F),
        _ => None,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rom = match env::args().nth(1) {
        Some(path) => fs::read(path)?,
        None => DIGIT_LOOP.to_vec(),
    };

    let pad = WindowPad::new();
    let running = Arc::new(AtomicBool::new(true));

    let mut machine = Machine::new(Arc::clone(&pad), None);
    machine.load_program(&rom)?;

    // latest framebuffer snapshot, refreshed by the worker on display ops
    let frame = Arc::new(Mutex::new(machine.display()));

    let worker = {
        let frame = Arc::clone(&frame);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                match machine.step() {
                    Ok(op) => {
                        if op.is_display_op() {
                            *frame.lock().unwrap() = machine.display();
                        }
                    }
                    Err(err) => {
                        eprintln!("machine halted: {}", err);
                        break;
                    }
                }
                thread::sleep(STEP_INTERVAL);
            }
            machine.dispose();
        })
    };

    let mut window = Window::new(
        "ocho (CHIP-8)",
        WIDTH,
        HEIGHT,
        WindowOptions {
            resize: true,
            scale_mode: ScaleMode::UpperLeft,
            ..WindowOptions::default()
        },
    )
    .expect("unable to create window");

    // the display only needs about 60 Hz, which is 16ms
    window.limit_update_rate(Some(Duration::from_millis(16)));

    while window.is_open() && !window.is_key_down(WindowKey::Escape) {
        if let Some(keys_down) = window.get_keys() {
            pad.refresh(&keys_down);
        }

        let buffer: Vec<u32> = frame
            .lock()
            .unwrap()
            .iter()
            .map(|&on| if on { LIT } else { DARK })
            .collect();
        window.update_with_buffer(&buffer, WIDTH, HEIGHT).unwrap();
    }

    running.store(false, Ordering::Release);
    pad.shutdown();
    worker.join().expect("machine thread panicked");
    Ok(())
}
