//! Console input line discipline.

use hal::Errno;

use crate::config::TTY_BUF_LEN;
use crate::sync::IrqSpinLock;
use crate::wait::{TaskControl, WaitQueue};

const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7f;
const ERASE_ECHO: &[u8] = b"\x1b[1D \x1b[1D";

/// Bytes typed since the last completed read.
pub struct LineBuffer {
    buf: [u8; TTY_BUF_LEN],
    len: usize,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self {
            buf: [0; TTY_BUF_LEN],
            len: 0,
        }
    }

    /// Applies one input byte, echoing through `echo`. Returns true when the
    /// byte completed a line.
    pub fn push(&mut self, byte: u8, echo: &mut impl FnMut(&[u8])) -> bool {
        let byte = if byte == b'\r' { b'\n' } else { byte };
        match byte {
            BACKSPACE | DEL => {
                if self.len > 0 && !self.has_line() {
                    self.len -= 1;
                    echo(ERASE_ECHO);
                }
                false
            }
            b'\n' => {
                if self.len >= TTY_BUF_LEN || self.has_line() {
                    return false;
                }
                self.buf[self.len] = b'\n';
                self.len += 1;
                echo(b"\r\n");
                true
            }
            _ => {
                if self.len < TTY_BUF_LEN - 1 && !self.has_line() {
                    self.buf[self.len] = byte;
                    self.len += 1;
                    echo(&[byte]);
                }
                false
            }
        }
    }

    /// A full line ending in a newline is buffered.
    pub fn has_line(&self) -> bool {
        self.len > 0 && self.buf[self.len - 1] == b'\n'
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Moves the buffered line into `dst`. A `dst` shorter than the line is
    /// rejected and the line is kept.
    pub fn take_line(&mut self, dst: &mut [u8]) -> Result<usize, Errno> {
        if dst.len() < self.len {
            return Err(Errno::InvalidArg);
        }
        let len = self.len;
        dst[..len].copy_from_slice(&self.buf[..len]);
        self.len = 0;
        Ok(len)
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The console terminal: one line buffer and the tasks blocked reading it.
#[derive(Default)]
pub struct Tty {
    line: IrqSpinLock<LineBuffer>,
    readers: WaitQueue,
}

impl Tty {
    pub const fn new() -> Self {
        Self {
            line: IrqSpinLock::new(LineBuffer::new()),
            readers: WaitQueue::new(),
        }
    }

    /// Feeds a received byte; wakes readers on end of line.
    pub fn receive<C: TaskControl + ?Sized>(&self, ctl: &C, byte: u8, mut echo: impl FnMut(&[u8])) {
        let complete = self.line.lock().push(byte, &mut echo);
        if complete {
            self.readers.wake_all(ctl);
        }
    }

    /// Blocks until a line is available, then copies it into `dst`.
    pub fn read_line<C: TaskControl + ?Sized>(&self, ctl: &C, dst: &mut [u8]) -> Result<usize, Errno> {
        let line = &self.line;
        self.readers.wait_until(ctl, || {
            let mut buffer = line.lock();
            if buffer.has_line() {
                Some(buffer.take_line(&mut *dst))
            } else {
                None
            }
        })?
    }
}
