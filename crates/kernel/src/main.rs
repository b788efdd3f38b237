#![no_std]
#![no_main]

use core::panic::PanicInfo;

use kernel::kprintln;

mod aarch64_entry;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    hal::irq::disable();
    kprintln!("panic: {}", info);
    arch_aarch64::halt_loop()
}
