//! Interrupt flag set from SIGINT/SIGTERM.
//!
//! The first signal only raises the flag so the running install can roll
//! back; a second one exits immediately.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

pub const INTERRUPTED_EXIT_CODE: i32 = 130;

fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    shutdown_flag().store(true, Ordering::Relaxed);
}

pub fn register_signal_handlers() -> io::Result<()> {
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        // SAFETY: the handler only touches an atomic and calls `_exit`.
        unsafe {
            signal_hook::low_level::register(signal, || {
                if shutdown_flag().swap(true, Ordering::Relaxed) {
                    signal_hook::low_level::exit(INTERRUPTED_EXIT_CODE);
                }
            })?;
        }
    }
    Ok(())
}
