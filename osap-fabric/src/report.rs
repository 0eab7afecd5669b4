//! Fault and debug reporting.
//!
//! Protocol faults are side-channel data, not control flow: the packet
//! involved is released or retried, the message lands here, and the latest
//! string plus counters stay readable through the root debug surface.
//! Everything is mirrored to the `log` facade.

/// Latest error/debug strings and their counters.
#[derive(Default)]
pub struct ReportSink {
    latest_error: String,
    latest_debug: String,
    error_count: u32,
    debug_count: u32,
}

impl ReportSink {
    /// Record a protocol fault.
    pub fn error(&mut self, msg: impl Into<String>) {
        self.latest_error = msg.into();
        self.error_count = self.error_count.wrapping_add(1);
        log::error!("{}", self.latest_error);
    }

    /// Record a debug note.
    pub fn debug(&mut self, msg: impl Into<String>) {
        self.latest_debug = msg.into();
        self.debug_count = self.debug_count.wrapping_add(1);
        log::debug!("{}", self.latest_debug);
    }

    /// Most recent fault message.
    #[must_use]
    pub fn latest_error(&self) -> &str {
        &self.latest_error
    }

    /// Most recent debug message.
    #[must_use]
    pub fn latest_debug(&self) -> &str {
        &self.latest_debug
    }

    /// Faults recorded so far.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Debug notes recorded so far.
    #[must_use]
    pub fn debug_count(&self) -> u32 {
        self.debug_count
    }
}
