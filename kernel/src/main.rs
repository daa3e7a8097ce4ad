//! Obsidian kernel boot binary
//!
//! Bare-metal entry point: the bootloader hands over a populated
//! boot-info record and the kernel brings its subsystems up in
//! dependency order. On hosted targets this is a stub; the kernel
//! library and its test suite are the interesting artifacts there.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare {
    use core::panic::PanicInfo;

    use obsidian_kernel::task::{self, SchedConfig};
    use obsidian_kernel::{arch, boot, log_service, mm, println, timer};

    /// Kernel panic: report the reason and the task that was running,
    /// then halt with interrupts disabled. No recovery is attempted.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("\n*** KERNEL PANIC ***");
        println!("{info}");
        match task::panic_context() {
            Some((pid, name)) => {
                let name = core::str::from_utf8(&name).unwrap_or("?");
                println!("while running pid {pid} ({})", name.trim_end_matches('\0'));
            }
            None => println!("before tasking was installed"),
        }
        arch::halt_loop()
    }

    /// Entry point. The bootloader has already populated `info` and left
    /// the CPU in 32-bit protected mode on the boot stack.
    #[no_mangle]
    pub extern "C" fn kernel_main(info: &'static boot::BootInfo) -> ! {
        println!("[Obsidian v{}]", env!("CARGO_PKG_VERSION"));
        log_service::init();

        // Wait out the keyboard controller before poking descriptors;
        // some BIOSes leave it mid-transaction.
        while arch::x86::keyboard_controller_busy() {
            core::hint::spin_loop();
        }

        arch::x86::init();

        boot::install(*info);
        mm::pmm::init().expect("boot info was just installed");
        mm::paging::init().expect("boot info was just installed");
        mm::heap::init_global();

        arch::x86::pit::init(timer::DEFAULT_HZ);
        task::init(SchedConfig::interactive(), "kernel-root");

        // SAFETY: Every subsystem is up; handlers may run now.
        unsafe { arch::enable_interrupts() };
        log::info!("kernel up, entering root loop");

        // The root task becomes the reaper for orphaned zombies.
        loop {
            match task::switch::wait() {
                Ok((pid, code)) => log::info!("reaped pid {pid} (status {code})"),
                Err(_) => task::switch::yield_now(),
            }
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("obsidian-kernel is a bare-metal image; boot it, don't run it.");
    eprintln!("(cargo test exercises the kernel library on the host.)");
}
