//! RT-safe reclamation for loop and slice buffers
//!
//! Loop content is handed to the render path behind `basedrop::Shared`
//! pointers. Dropping the last reference on the audio thread only enqueues
//! the pointer; the actual deallocation (which can involve slow munmap calls
//! for multi-second loops) happens on a background collector thread.

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Global handle for creating Shared<T> allocations
static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

/// Initialize the global collector and return a handle
fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("cadence-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it lives on this thread
            let mut collector = Collector::new();
            tx.send(collector.handle()).expect("Failed to send GC handle");

            log::info!("loop buffer GC thread started");

            loop {
                collector.collect();
                thread::sleep(Duration::from_millis(100));
            }
        })
        .expect("Failed to spawn GC thread");

    rx.recv().expect("Failed to receive GC handle")
}

/// Get a handle for wrapping values in `basedrop::Shared`
///
/// The handle is lightweight and can be cloned freely.
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
