//! The delay and sound countdown timers and the background ticker that
//! drives them.
//!
//! The two timers run on real time, not on the instruction clock: a machine
//! stepping at any speed still sees them count down 60 times a second. The
//! ticker is a single owned thread started when the machine is built and
//! stopped exactly once when it is disposed, so no interval can outlive its
//! machine.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Canonical CHIP-8 timer rate. Some historical interpreters ticked at
/// 120 Hz; 60 Hz is what the hardware did.
pub(crate) const TIMER_HZ: u64 = 60;

/// Real-time interval between timer decrements.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_micros(1_000_000 / TIMER_HZ);

/// The delay (DT) and sound (ST) registers, shared between the machine and
/// the ticker thread. Each field has a single conceptual writer at a time:
/// the ticker decrements, and only the Fx15/Fx18 instructions store.
#[derive(Default)]
pub(crate) struct Timers {
    delay: AtomicU8,
    sound: AtomicU8,
}

impl Timers {
    pub fn delay(&self) -> u8 {
        self.delay.load(Ordering::Acquire)
    }

    pub fn sound(&self) -> u8 {
        self.sound.load(Ordering::Acquire)
    }

    pub fn set_delay(&self, value: u8) {
        self.delay.store(value, Ordering::Release);
    }

    pub fn set_sound(&self, value: u8) {
        self.sound.store(value, Ordering::Release);
    }

    /// One 60 Hz tick: decrement both timers, each floored at zero.
    pub fn tick(&self) {
        let _ = self
            .delay
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        let _ = self
            .sound
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }
}

/// Handle to the ticker thread. Dropping it (directly, or through the
/// machine's `dispose`) signals the thread and joins it.
pub(crate) struct Ticker {
    stop: mpsc::Sender<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    pub fn start(timers: Arc<Timers>) -> Self {
        let (stop, stopped) = mpsc::channel();
        let thread = thread::spawn(move || loop {
            match stopped.recv_timeout(TICK_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => timers.tick(),
                _ => break,
            }
        });
        Ticker {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
