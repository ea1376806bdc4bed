//! The keyboard capability the machine consumes.
//!
//! The machine never implements input itself: it queries whatever
//! [`Keyboard`] it was constructed with, and the caller keeps ownership of
//! that capability (and of composing it out of several physical or virtual
//! sources, see [`MultiKeyboard`]).
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// One of the 16 keys on the CHIP-8's hexadecimal keypad.
///
/// The keypad is laid out as:
///
/// ```text
/// +-+-+-+-+
/// |1|2|3|C|
/// +-+-+-+-+
/// |4|5|6|D|
/// +-+-+-+-+
/// |7|8|9|E|
/// +-+-+-+-+
/// |A|0|B|F|
/// +-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Key {
    Key0 = 0x0,
    Key1 = 0x1,
    Key2 = 0x2,
    Key3 = 0x3,
    Key4 = 0x4,
    Key5 = 0x5,
    Key6 = 0x6,
    Key7 = 0x7,
    Key8 = 0x8,
    Key9 = 0x9,
    A = 0xA,
    B = 0xB,
    C = 0xC,
    D = 0xD,
    E = 0xE,
    F = 0xF,
}

impl Key {
    /// The key's code, between 0x0 and 0xF.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The key for a code between 0x0 and 0xF, or None for anything larger.
    pub fn from_code(code: u8) -> Option<Key> {
        match code {
            0x0 => Some(Key::Key0),
            0x1 => Some(Key::Key1),
            0x2 => Some(Key::Key2),
            0x3 => Some(Key::Key3),
            0x4 => Some(Key::Key4),
            0x5 => Some(Key::Key5),
            0x6 => Some(Key::Key6),
            0x7 => Some(Key::Key7),
            0x8 => Some(Key::Key8),
            0x9 => Some(Key::Key9),
            0xA => Some(Key::A),
            0xB => Some(Key::B),
            0xC => Some(Key::C),
            0xD => Some(Key::D),
            0xE => Some(Key::E),
            0xF => Some(Key::F),
            _ => None,
        }
    }
}

/// The input capability consumed by the machine.
///
/// `Ex9E`/`ExA1` query [`pressed_key`](Keyboard::pressed_key) for the key
/// currently held down. `Fx0A` calls
/// [`next_key_press`](Keyboard::next_key_press) and blocks on the returned
/// channel; implementations hand out a fresh channel per call and send at
/// most one key on it, so every wait has to register anew. Dropping the
/// sending side without delivering a key tells the machine the capability
/// has shut down.
pub trait Keyboard: Send + Sync {
    /// The key currently held down, if any.
    fn pressed_key(&self) -> Option<Key>;

    /// A one-shot channel that yields the next key pressed after this call.
    fn next_key_press(&self) -> mpsc::Receiver<Key>;
}

/// A keyboard composed of several sources: pressed state comes from the
/// first source holding a key down, and a key wait resolves with whichever
/// source presses first.
pub struct MultiKeyboard {
    sources: Vec<Arc<dyn Keyboard>>,
}

impl MultiKeyboard {
    pub fn new(sources: Vec<Arc<dyn Keyboard>>) -> Self {
        MultiKeyboard { sources }
    }
}

impl Keyboard for MultiKeyboard {
    fn pressed_key(&self) -> Option<Key> {
        self.sources.iter().find_map(|source| source.pressed_key())
    }

    fn next_key_press(&self) -> mpsc::Receiver<Key> {
        let (tx, rx) = mpsc::channel();

        // race the sources: forward each one's next press, first send wins
        // and the rest go nowhere once the receiver is gone
        for source in &self.sources {
            let pressed = source.next_key_press();
            let tx = tx.clone();
            thread::spawn(move || {
                if let Ok(key) = pressed.recv() {
                    let _ = tx.send(key);
                }
            });
        }
        rx
    }
}
