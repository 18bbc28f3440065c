//! Logging facade for fastevent.
//!
//! Enabled by the default `tracing` feature. With the feature disabled every
//! log macro expands to an empty block, so background loops pay nothing for
//! their diagnostics and call sites may use the macros as expressions.

/// Installs the global tracing subscriber.
///
/// Binaries call this once at startup; integration tests call it through a
/// `std::sync::Once`. The filter defaults to `fastevent=info` and can be
/// overridden with `RUST_LOG`. A second call is a no-op.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fastevent=info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

/// Installs the global tracing subscriber (no-op without the `tracing` feature).
#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! trace_noop {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! info_noop {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use error_noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use info_noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use trace_noop as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use warn_noop as warn;

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(result: Result<u8, u8>) {
        match result {
            Ok(value) if value == 0 => trace!(value, "zero"),
            Ok(value) if value == 1 => debug!(value, "one"),
            Ok(value) => info!(value, "other"),
            Err(code) if code == 0 => warn!(code, "soft failure"),
            Err(code) => error!(code, "hard failure"),
        }
    }

    #[test]
    fn log_macros_are_usable_in_expression_position() {
        for result in [Ok(0), Ok(1), Ok(2), Err(0), Err(1)] {
            classify(result);
        }
        let () = warn!("as a value");
    }
}
