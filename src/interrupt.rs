//! Ctrl-C handling
//!
//! The capture loop is synchronous and blocks on the byte source, so the
//! signal is awaited on a dedicated thread with a single-threaded tokio
//! runtime. When it fires, the shared stop flag is raised and the session
//! winds down at its next poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Raise `stop_flag` when the process receives Ctrl-C.
///
/// # Errors
///
/// Returns an I/O error if the runtime or the watcher thread cannot be
/// created.
pub fn install_interrupt_handler(stop_flag: Arc<AtomicBool>) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("interrupt-watcher".into())
        .spawn(move || {
            match runtime.block_on(tokio::signal::ctrl_c()) {
                Ok(()) => {
                    log::info!("Interrupt received, stopping capture");
                    stop_flag.store(true, Ordering::Release);
                }
                Err(e) => log::warn!("Unable to listen for Ctrl-C: {}", e),
            }
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_leaves_flag_clear() {
        let stop = Arc::new(AtomicBool::new(false));
        install_interrupt_handler(Arc::clone(&stop)).unwrap();
        assert!(!stop.load(Ordering::Acquire));
    }
}
