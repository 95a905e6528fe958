//! Serialised access to a global [`logtest::Logger`].

use std::sync::{Mutex, MutexGuard, OnceLock};

use logtest::Logger;
use rstest::fixture;

/// Handle to the global logger with exclusive access.
///
/// The server logs from its worker thread, so records from every test in
/// the process land in one logger. Holding this guard keeps other tests from
/// draining it concurrently.
pub struct LoggerHandle {
    guard: MutexGuard<'static, Logger>,
}

impl LoggerHandle {
    /// Acquire the global [`Logger`] instance, discarding stale records.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder panicked while holding the lock.
    #[must_use]
    pub fn new() -> Self {
        static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

        let logger = LOGGER.get_or_init(|| Mutex::new(Logger::start()));
        let mut guard = logger.lock().expect("logger poisoned");
        while guard.pop().is_some() {}

        Self { guard }
    }

    /// Pop every captured record and return the formatted messages.
    pub fn messages(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        while let Some(record) = self.guard.pop() {
            messages.push(record.args().to_string());
        }
        messages
    }
}

impl Default for LoggerHandle {
    fn default() -> Self { Self::new() }
}

impl std::ops::Deref for LoggerHandle {
    type Target = Logger;

    fn deref(&self) -> &Self::Target { &self.guard }
}

impl std::ops::DerefMut for LoggerHandle {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.guard }
}

#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
#[fixture]
pub fn logger() -> LoggerHandle { LoggerHandle::new() }
