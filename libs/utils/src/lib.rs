//! Small pieces shared by every crate in the workspace: process plumbing
//! (logging, signals, PID-file locking), typed ids, and filesystem path
//! helpers that don't belong to any one component.

pub mod id;
pub mod lock_file;
pub mod logging;
pub mod paths;
pub mod signals;

/// Expands at compile time to a `const NAME: &str` holding the crate
/// version plus (if available at build time) a short VCS revision,
/// so `--version` output and startup logs can identify exactly what's
/// running without a network round trip.
#[macro_export]
macro_rules! project_version {
    ($const_name:ident) => {
        const $const_name: &str = $crate::const_format::formatcp!(
            "{} ({})",
            env!("CARGO_PKG_VERSION"),
            option_env!("BUILD_REVISION").unwrap_or("unknown")
        );
    };
}

#[doc(hidden)]
pub use const_format;
