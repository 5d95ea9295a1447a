#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod arch;
pub mod serial;
pub mod video;
pub mod collections;
pub mod memory;
pub mod sync;
pub mod process;
pub mod scheduler;
pub mod ipc;
pub mod drivers;
pub mod interrupts;
pub mod syscalls;

#[cfg(not(test))]
use core::panic::PanicInfo;

/// Shell binary placed by the bootloader at a fixed address.
pub const SHELL_MODULE_ADDRESS: u64 = 0x40_0000;

#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    serial::init();
    video::init();
    log_info!("NucleoOS Kernel started.");

    memory::init();
    log_info!("NucleoOS Memory initialized.");

    if let Ok(boot_info) = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
    } {
        if let Some(map) = boot_info.memory_map_tag() {
            let available: u64 = map
                .memory_areas()
                .iter()
                .map(|area| area.size())
                .sum();
            log_info!("Multiboot2 memory map: {} KiB available.", available / 1024);
        }
    }

    interrupts::init();
    process::init_pcb_table();
    scheduler::init();
    ipc::init();
    drivers::init();
    println!("NucleoOS is successfully running!");

    if process::start_init_process(process::TaskEntry::Module(SHELL_MODULE_ADDRESS)).is_none() {
        panic!("Failed to start the init process.");
    }

    arch::enable_interrupts();

    // The first timer tick switches into the idle process frame and this
    // boot stack is never returned to.
    loop {
        arch::halt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    arch::disable_interrupts();
    println!("{}", info);
    log_error!("{}", info);
    loop {
        arch::halt();
    }
}
