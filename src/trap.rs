//! Trap dispatch glue.
//!
//! On metal the ISR stub saves the general registers, calls the C-level
//! handler, and its interrupt-return pops the hardware error code. The
//! handler itself takes no parameters: the faulting address is latched in
//! CR2. That contract survives here as a free function over a kernel
//! installed at boot; everything the handler needs it reaches through the
//! kernel object.

use spin::Mutex;

use crate::Kernel;

/// The installed kernel, if any.
static KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);

/// Install `kernel` as the one the trap entries dispatch to. Returns the
/// previously installed kernel.
pub fn install(kernel: Kernel) -> Option<Kernel> {
    KERNEL.lock().replace(kernel)
}

/// Remove the installed kernel.
pub fn uninstall() -> Option<Kernel> {
    KERNEL.lock().take()
}

/// Run `f` against the installed kernel.
///
/// # Panics
///
/// If no kernel is installed.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let mut kernel = KERNEL.lock();
    f(kernel.as_mut().expect("no kernel installed"))
}

/// The page-fault entry: no parameters, no return value. Reads CR2 and runs
/// the handler; by the time this returns, either the faulting access can be
/// retried or the faulting process is gone.
pub fn pagefault_handler() {
    with_kernel(|kernel| {
        kernel.handle_pagefault();
    });
}
