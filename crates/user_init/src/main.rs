#![no_std]
#![no_main]

use core::panic::PanicInfo;

use user_init::selftest::{self, RoundResult, XorShift};
use user_init::shell::{self, SysTerminal};
use user_init::sys::{self, Fork};
use user_init::{println, Malloc, Sbrk, SysBrk};

const STACK_ROUNDS: usize = 1000;
const MALLOC_ROUNDS: usize = 64;

#[no_mangle]
#[link_section = ".text.entry"]
pub extern "C" fn _start() -> ! {
    user_init::init_logger();
    println!("userspace init");

    spawn("sbrk", sbrk_test);
    spawn("exec_kernel", exec_kernel_test);
    spawn("read_kernel", read_kernel_test);
    spawn("sbrk_unmap", sbrk_unmap_test);
    spawn("stack", stack_test);
    spawn("exit", exit_test);
    spawn("malloc", malloc_test);
    spawn("sleep", sleep_test);
    spawn("shell", shell_main);

    loop {
        println!("Entering pause()");
        let _ = sys::pause();
    }
}

/// Runs `body` in a child and exits with its status.
fn spawn(name: &str, body: fn() -> i64) {
    match sys::fork() {
        Ok(Fork::Parent { child }) => log::info!("init: {} test is pid {}", name, child),
        Ok(Fork::Child) => sys::exit(body()),
        Err(err) => println!("fork of {} failed: {:?}", name, err),
    }
}

fn sbrk_test() -> i64 {
    match selftest::sbrk_cycle(&mut Sbrk::new(SysBrk)) {
        Ok(()) => {
            println!("test sbrk success");
            0
        }
        Err(increment) => {
            println!("test sbrk failed at increment {}", increment);
            -1
        }
    }
}

fn exec_kernel_test() -> i64 {
    println!("exec_kernel_test");
    selftest::exec_kernel();
    println!("exec_kernel_test: should not reach here");
    -1
}

fn read_kernel_test() -> i64 {
    println!("read_kernel_test");
    let value = selftest::read_kernel();
    println!("read_kernel_test: should not reach here ({:#x})", value);
    -1
}

fn sbrk_unmap_test() -> i64 {
    if selftest::sbrk_unmap(&mut Sbrk::new(SysBrk)).is_none() {
        println!("sbrk_unmap_test: brk refused");
        return -1;
    }
    println!("sbrk_unmap_test: should not reach here");
    -1
}

fn stack_test() -> i64 {
    let mut last = 0;
    for _ in 0..STACK_ROUNDS {
        last = selftest::factorial(1000);
    }
    println!("stack test done ({:#x})", last);
    0
}

fn exit_test() -> i64 {
    println!("exit_test, user process exiting");
    -1
}

fn malloc_test() -> i64 {
    let Some(mut heap) = Malloc::new(SysBrk) else {
        println!("malloc pool setup failed");
        return -1;
    };
    println!("Testing malloc, pool span {}", heap.span());
    let mut rng = XorShift::new(0x5EED);
    for round in 0..MALLOC_ROUNDS {
        match selftest::malloc_round(&mut heap, &mut rng) {
            RoundResult::Passed => {}
            RoundResult::Exhausted => {
                println!("malloc exhausted after {} rounds", round);
                break;
            }
            RoundResult::Corrupted => {
                println!("malloc round {} corrupted the heap", round);
                return -1;
            }
        }
    }
    println!("malloc test over.");
    0
}

fn sleep_test() -> i64 {
    for _ in 0..2 {
        println!("Sleeping for 1 seconds.");
        sys::sleep(1);
    }
    -1
}

fn shell_main() -> i64 {
    loop {
        let err = shell::run(&mut SysTerminal);
        println!("shell exited: {:?}", err);
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("init panic: {}", info);
    sys::exit(-1)
}
