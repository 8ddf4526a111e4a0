//! Maintenance of `tiercache` disk caches.
//!
//! The disk tier only evicts when it is written to, and never removes entries that are merely old.
//! This tool cleans up caches according to the configured retention, and inspects or clears them.

#![warn(missing_debug_implementations, clippy::all)]

use tiercache::logging;

mod cli;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
