#![allow(dead_code)]

use rand::{CryptoRng, RngCore};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

/// Returned once the injected values run out.
pub const MOCK_FALLBACK_WORD: u32 = 0xA5A5_A5A5;

#[derive(Default)]
struct MockEntropyState {
    queue: VecDeque<u32>,
    draws: usize,
}

/// Deterministic entropy source that replays injected words and counts draws.
///
/// Clones share state, so a test can keep a handle after moving the source into a device.
#[derive(Clone, Default)]
pub struct MockEntropy {
    state: Rc<RefCell<MockEntropyState>>,
}

impl MockEntropy {
    pub fn with_values(values: impl IntoIterator<Item = u32>) -> Self {
        let src = Self::default();
        src.state.borrow_mut().queue.extend(values);
        src
    }

    pub fn draws(&self) -> usize {
        self.state.borrow().draws
    }
}

impl RngCore for MockEntropy {
    fn next_u32(&mut self) -> u32 {
        let mut state = self.state.borrow_mut();
        state.draws += 1;
        state.queue.pop_front().unwrap_or(MOCK_FALLBACK_WORD)
    }

    fn next_u64(&mut self) -> u64 {
        let lo = u64::from(self.next_u32());
        let hi = u64::from(self.next_u32());
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for MockEntropy {}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a WARN-level fmt subscriber installed for the current thread and return its
/// result together with everything that was logged.
pub fn capture_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buf = SharedBuf::default();
    let writer = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();

    let out = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buf.0.lock().unwrap()).into_owned();
    (out, logs)
}
