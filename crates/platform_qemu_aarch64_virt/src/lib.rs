#![no_std]

//! QEMU `virt` board support: memory layout, PL011 UART, GICv2 and the
//! generic timer.

#[cfg(test)]
extern crate std;

pub mod gic;
pub mod timer;

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};

use hal::PhysAddr;

pub const RAM_START: PhysAddr = 0x4000_0000;
pub const RAM_SIZE: u64 = 1 << 30;

/// Start of the kernel heap pool.
pub const HEAP_START: PhysAddr = RAM_START + (256 << 20);
pub const HEAP_SIZE: u64 = 512 << 20;

/// Start of the physical page pool.
pub const PAGE_POOL_START: PhysAddr = HEAP_START + HEAP_SIZE;
pub const PAGE_POOL_SIZE: u64 = 256 << 20;

/// Device window below RAM.
pub const DEVICE_START: PhysAddr = 0;
pub const DEVICE_SIZE: u64 = RAM_START;

pub const NUM_CPUS: usize = 4;

pub const UART_BASE: PhysAddr = 0x0900_0000;
pub const GIC_DIST_BASE: PhysAddr = 0x0800_0000;
pub const GIC_CPU_BASE: PhysAddr = 0x0801_0000;

pub const IRQ_TIMER: u32 = 30;
pub const IRQ_UART: u32 = 33;

const UART_DR: u64 = 0x00;
const UART_FR: u64 = 0x18;
const UART_IBRD: u64 = 0x24;
const UART_FBRD: u64 = 0x28;
const UART_CR: u64 = 0x30;
const UART_IMSC: u64 = 0x38;
const UART_MIS: u64 = 0x40;
const UART_ICR: u64 = 0x44;

const FR_RXFE: u32 = 1 << 4;
const FR_TXFF: u32 = 1 << 5;
const INT_RX: u32 = 1 << 4;
const CR_ENABLE: u32 = 0x0301;

static MMIO_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Sets the virtual offset at which device registers are reached.
pub fn set_mmio_offset(offset: u64) {
    MMIO_OFFSET.store(offset, Ordering::Relaxed);
}

fn mmio(pa: PhysAddr) -> *mut u32 {
    (pa.wrapping_add(MMIO_OFFSET.load(Ordering::Relaxed))) as *mut u32
}

pub(crate) fn reg_read(pa: PhysAddr) -> u32 {
    // SAFETY: device registers of this board are always mapped.
    unsafe { read_volatile(mmio(pa)) }
}

pub(crate) fn reg_write(pa: PhysAddr, value: u32) {
    // SAFETY: see `reg_read`.
    unsafe { write_volatile(mmio(pa), value) }
}

/// Initializes platform devices such as the UART.
pub fn init() {
    uart_init();
}

/// Writes a byte to the PL011 UART.
pub fn uart_write(byte: u8) {
    while reg_read(UART_BASE + UART_FR) & FR_TXFF != 0 {}
    reg_write(UART_BASE + UART_DR, byte as u32);
}

/// Returns true if UART receive data is available.
pub fn uart_has_data() -> bool {
    reg_read(UART_BASE + UART_FR) & FR_RXFE == 0
}

/// Reads a byte from the UART.
pub fn uart_read_byte() -> u8 {
    while !uart_has_data() {}
    (reg_read(UART_BASE + UART_DR) & 0xFF) as u8
}

/// Pops one received byte if the receive interrupt is pending.
pub fn uart_take_rx() -> Option<u8> {
    if reg_read(UART_BASE + UART_MIS) & INT_RX == 0 || !uart_has_data() {
        return None;
    }
    Some((reg_read(UART_BASE + UART_DR) & 0xFF) as u8)
}

fn uart_init() {
    reg_write(UART_BASE + UART_CR, 0);
    reg_write(UART_BASE + UART_IBRD, 0x0D);
    reg_write(UART_BASE + UART_FBRD, 0x02);
    reg_write(UART_BASE + UART_ICR, 0x7ff);
    reg_write(UART_BASE + UART_IMSC, INT_RX);
    reg_write(UART_BASE + UART_CR, CR_ENABLE);
}
