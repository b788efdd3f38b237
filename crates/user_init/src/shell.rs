//! Line shell on the console.

use hal::Errno;

pub const PROMPT: &[u8] = b"# ";
pub const LINE_LEN: usize = 256;

const HELP: &[u8] = b"Built-in commands: help, man\n";
const NOT_FOUND: &[u8] = b": command not found\n";

/// A parsed input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Help,
    Empty,
    Unknown(&'a [u8]),
}

impl<'a> Command<'a> {
    /// Parses one line as returned by `read`, trailing newline included.
    pub fn parse(line: &'a [u8]) -> Self {
        if line.starts_with(b"help") || line.starts_with(b"man") {
            return Command::Help;
        }
        let text = line.strip_suffix(b"\n").unwrap_or(line);
        if text.is_empty() {
            Command::Empty
        } else {
            Command::Unknown(text)
        }
    }
}

/// Console access for the shell.
pub trait Terminal {
    fn read_line(&mut self, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&mut self, bytes: &[u8]);
}

/// The console reached through `read`/`write`.
pub struct SysTerminal;

impl Terminal for SysTerminal {
    fn read_line(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        crate::sys::read(0, buf)
    }

    fn write(&mut self, bytes: &[u8]) {
        let _ = crate::sys::write(1, bytes);
    }
}

/// Writes the response to `command`.
pub fn respond<T: Terminal>(term: &mut T, command: Command<'_>) {
    match command {
        Command::Help => term.write(HELP),
        Command::Empty => {}
        Command::Unknown(name) => {
            term.write(name);
            term.write(NOT_FOUND);
        }
    }
}

/// Prompts, reads and answers one line. Read failures are returned.
pub fn step<T: Terminal>(term: &mut T) -> Result<(), Errno> {
    let mut buf = [0u8; LINE_LEN];
    term.write(PROMPT);
    let len = term.read_line(&mut buf)?;
    respond(term, Command::parse(&buf[..len]));
    Ok(())
}

/// Runs the shell until the console fails.
pub fn run<T: Terminal>(term: &mut T) -> Errno {
    loop {
        if let Err(err) = step(term) {
            return err;
        }
    }
}
