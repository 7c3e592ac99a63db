//! Provides an IO pipe for shuffling bytes between two threads.
//!
//! The implementation is a bounded ring guarded by a mutex and a pair of
//! condition variables; both ends block until progress is possible. Either
//! side may disconnect with an error, which is surfaced to the peer on its
//! next read or write.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

/// Constructs a pipe with the provided buffer capacity in bytes.
pub fn new(capacity: usize) -> (Writer, Reader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            writer_alive: true,
            reader_alive: true,
            writer_error: None,
            reader_error: None,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });
    (
        Writer {
            shared: Arc::clone(&shared),
        },
        Reader { shared },
    )
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
}

struct State {
    buffer: VecDeque<u8>,
    capacity: usize,
    writer_alive: bool,
    reader_alive: bool,
    writer_error: Option<io::Error>,
    reader_error: Option<io::Error>,
}

/// Producer side of a pipe.
pub struct Writer {
    shared: Arc<Shared>,
}

impl Writer {
    /// Disconnects the writer with an error that will be propagated
    /// to the reader side.
    pub fn disconnect_with_error(self, error: io::Error) {
        self.shared.state.lock().unwrap().writer_error = Some(error);
        drop(self);
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if !state.reader_alive {
                let error = state.reader_error.take().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed")
                });
                return Err(error);
            }
            let available = state.capacity - state.buffer.len();
            if available > 0 {
                let n = available.min(buf.len());
                state.buffer.extend(&buf[..n]);
                self.shared.readable.notify_one();
                return Ok(n);
            }
            state = self.shared.writable.wait(state).unwrap();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().writer_alive = false;
        self.shared.readable.notify_all();
    }
}

/// Consumer side of a pipe.
pub struct Reader {
    shared: Arc<Shared>,
}

impl Reader {
    /// Disconnects the reader with an error that will be propagated to the
    /// writer side.
    pub fn disconnect_with_error(self, error: io::Error) {
        self.shared.state.lock().unwrap().reader_error = Some(error);
        drop(self);
    }
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if !state.buffer.is_empty() {
                let mut n = 0;
                while n < buf.len() {
                    match state.buffer.pop_front() {
                        Some(byte) => {
                            buf[n] = byte;
                            n += 1;
                        }
                        None => break,
                    }
                }
                self.shared.writable.notify_one();
                return Ok(n);
            }
            if !state.writer_alive {
                return match state.writer_error.take() {
                    Some(error) => Err(error),
                    // EOF
                    None => Ok(0),
                };
            }
            state = self.shared.readable.wait(state).unwrap();
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().reader_alive = false;
        self.shared.writable.notify_all();
    }
}
