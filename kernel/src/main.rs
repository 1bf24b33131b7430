#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use core::panic::PanicInfo;

use halcyon_kernel::arch::x86::cpu;
use halcyon_kernel::serial::SerialConsole;
use halcyon_kernel::{bootstrap, kprintln, sched, serial};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kprintln!("[KERNEL PANIC] {}", info);
    unsafe { cpu::cli() };
    loop {
        cpu::hlt();
    }
}

/// Entry point handed control by the boot loader stub (outside this crate's
/// scope, same as the rest of the boot trampoline). The assembly stub is
/// expected to preserve the multiboot info pointer GRUB leaves in EBX and
/// pass it through as `multiboot_info_addr`, per the multiboot protocol.
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    // SAFETY: COM1 is not otherwise owned at this point in boot.
    let mut console = unsafe { SerialConsole::new(SerialConsole::COM1) };
    console.init();
    serial::install(Box::new(console));
    kprintln!("kernel starting");

    if let Err(e) = bootstrap::init(multiboot_info_addr) {
        kprintln!("[BOOT] initialization failed: {e}");
        loop {
            cpu::hlt();
        }
    }

    sched::run();
}
