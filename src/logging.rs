//! Logging prelude module for convenient access to tracing macros.
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("Session {} opened", id);
//! debug!("Session {} <- {}", id, record.cmd());
//! ```

pub use tracing::{debug, error, info, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// `RUST_LOG` wins when set; otherwise `level` is used as the filter:
///
/// ```bash
/// RUST_LOG=debug sharetree serve
/// RUST_LOG=sharetree::session=debug,sharetree::connector=info sharetree watch /plant/
/// ```
///
/// Calling it more than once is harmless; only the first call installs a subscriber.
pub fn init_tracing(level: &str) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}
