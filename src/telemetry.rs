//! Opt-in `tracing_subscriber` installer. Library code only ever emits
//! events through `tracing`; nothing in `harmonics` installs a global
//! subscriber on its own, so embedding applications keep control of their
//! own logging setup. Binaries, demos and tests call [`init`] once at
//! startup to see those events on stderr.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber honouring `RUST_LOG` (defaulting to `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
