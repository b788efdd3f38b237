#![cfg_attr(not(test), no_std)]

//! Library side of the user init program: system calls, the break-backed
//! heap, the shell and the self-checks.

#[cfg(test)]
extern crate alloc;

pub mod heap;
pub mod selftest;
pub mod shell;
pub mod sys;

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};

pub use heap::{BreakSource, Malloc, Sbrk, SysBrk};
pub use sys::Fork;

/// Standard output through `write(1, ..)`.
pub struct Stdout;

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        sys::write(1, s.as_bytes()).map(|_| ()).map_err(|_| fmt::Error)
    }
}

pub fn print(args: fmt::Arguments) {
    let _ = Stdout.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        $crate::print(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! println {
    () => {{
        $crate::print!("\n");
    }};
    ($($arg:tt)*) => {{
        $crate::print!("{}\n", format_args!($($arg)*));
    }};
}

struct UserLogger;

impl Log for UserLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("[{:<5} user] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: UserLogger = UserLogger;

/// Routes `log` records, including heap diagnostics, to standard output.
pub fn init_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
