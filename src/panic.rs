//! Panic payload formatting and reporting.
//!
//! Panics raised by application callbacks or handshake tasks are caught so
//! that a single misbehaving connection cannot stop the worker. These helpers
//! turn the payload into something printable and log it.

use std::{any::Any, fmt};

use log::error;

/// Wrapper that formats a panic payload when logged or displayed.
///
/// The payload is downcast to `String` or `&'static str` if possible and falls
/// back to `Debug` formatting otherwise.
///
/// ```
/// use wsengine::panic::format_panic;
/// assert_eq!(format_panic(Box::new("boom")).to_string(), "boom");
/// assert!(format_panic(Box::new(5_u32)).to_string().contains("Any"));
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

/// Create a [`PanicMessage`] for the given payload.
pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage { PanicMessage(panic) }

/// Log a caught panic through both `log` and `tracing`.
///
/// `context` names what was running, for example `"engine command"`.
pub(crate) fn report_panic(context: &str, panic: Box<dyn Any + Send>, detail: &dyn fmt::Debug) {
    let panic_msg = format_panic(panic);
    crate::metrics::inc_errors(crate::metrics::ErrorKind::Panic);
    error!("{context} panicked: panic={panic_msg}, detail={detail:?}");
    tracing::error!(panic = %panic_msg, ?detail, "{context} panicked");
}
