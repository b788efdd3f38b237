//! GICv2 distributor and CPU interface.

use crate::{reg_read, reg_write, GIC_CPU_BASE, GIC_DIST_BASE};

const GICD_CTLR: u64 = 0x000;
const GICD_ISENABLER: u64 = 0x100;
const GICD_ICENABLER: u64 = 0x180;
const GICD_ITARGETSR: u64 = 0x800;
const GICD_ICFGR: u64 = 0xC00;

const GICC_CTLR: u64 = 0x00;
const GICC_PMR: u64 = 0x04;
const GICC_IAR: u64 = 0x0C;
const GICC_EOIR: u64 = 0x10;

/// Interrupt ids at and above this value are spurious.
pub const SPURIOUS: u32 = 1020;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Level,
    Edge,
}

/// Enables forwarding from the distributor.
pub fn init_distributor() {
    reg_write(GIC_DIST_BASE + GICD_CTLR, 1);
}

/// Unmasks every priority and enables signalling to the calling core.
pub fn init_cpu_interface() {
    reg_write(GIC_CPU_BASE + GICC_PMR, 0xFF);
    reg_write(GIC_CPU_BASE + GICC_CTLR, 1);
}

/// Routes `irq` to the cores in `targets` and enables it. Target masks
/// are ignored for private interrupts.
pub fn enable_irq(irq: u32, trigger: Trigger, targets: u8) {
    let word = (irq / 32) as u64 * 4;
    let bit = 1 << (irq % 32);
    reg_write(GIC_DIST_BASE + GICD_ICENABLER + word, bit);
    if irq >= 32 {
        let shift = (irq % 4) * 8;
        let addr = GIC_DIST_BASE + GICD_ITARGETSR + (irq / 4) as u64 * 4;
        let value = reg_read(addr) & !(0xFF << shift) | (targets as u32) << shift;
        reg_write(addr, value);
    }
    let cfg_addr = GIC_DIST_BASE + GICD_ICFGR + (irq / 16) as u64 * 4;
    let cfg_shift = (irq % 16) * 2 + 1;
    let cfg = reg_read(cfg_addr);
    let cfg = match trigger {
        Trigger::Edge => cfg | 1 << cfg_shift,
        Trigger::Level => cfg & !(1 << cfg_shift),
    };
    reg_write(cfg_addr, cfg);
    reg_write(GIC_DIST_BASE + GICD_ISENABLER + word, bit);
}

/// Acknowledges the highest-priority pending interrupt.
pub fn acknowledge() -> u32 {
    reg_read(GIC_CPU_BASE + GICC_IAR) & 0x3FF
}

pub fn end_of_interrupt(irq: u32) {
    reg_write(GIC_CPU_BASE + GICC_EOIR, irq);
}
