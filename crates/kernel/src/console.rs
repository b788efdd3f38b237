use core::fmt::{self, Write};

use kernel_core::{ConsoleSink, IrqSpinLock};
use log::{LevelFilter, Log, Metadata, Record};

use crate::platform;

/// Serializes output so lines from different cores do not interleave.
static CONSOLE_LOCK: IrqSpinLock<()> = IrqSpinLock::new(());

pub fn print(args: fmt::Arguments) {
    let _guard = CONSOLE_LOCK.lock();
    let mut writer = ConsoleWriter;
    let _ = writer.write_fmt(args);
}

/// Writes raw bytes with no newline translation.
pub fn write_bytes(bytes: &[u8]) {
    let _guard = CONSOLE_LOCK.lock();
    for &byte in bytes {
        platform::uart_write(byte);
    }
}

/// Console output as seen by user `write` calls.
pub struct Console;

impl ConsoleSink for Console {
    fn write_bytes(&self, bytes: &[u8]) {
        write_bytes(bytes);
    }
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                platform::uart_write(b'\r');
            }
            platform::uart_write(byte);
        }
        Ok(())
    }
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::kprintln!(
                "[{:<5} cpu{}] {}",
                record.level(),
                crate::arch::core_id(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs the console as the `log` backend.
pub fn init_logger() {
    if log::set_logger(&LOGGER).is_err() {
        return;
    }
    let level = if cfg!(feature = "debug_log") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    log::set_max_level(level);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::console::print(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint!("\n");
    }};
    ($($arg:tt)*) => {{
        $crate::kprint!("{}\n", format_args!($($arg)*));
    }};
}
