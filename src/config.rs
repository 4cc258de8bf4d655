// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Crate-wide tuning knobs, collected into a single struct callers can
//! override.

use crate::fail::Fail;

/// Tuning knobs for a [`crate::runtime::Runtime`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Backlog passed to `listen(2)`.
    pub backlog: i32,
    /// Per-direction scratch buffer size on each connection.
    pub buffer_capacity: usize,
    /// Maximum readiness events drained per `EventNotifier::wait` call.
    pub event_batch: usize,
    /// Filter string passed to `flexi_logger` by [`init_logging`].
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backlog: 1024,
            buffer_capacity: 8 * 1024,
            event_batch: 1024,
            log_filter: "info".to_string(),
        }
    }
}

/// Initializes `flexi_logger` with `config.log_filter`. Safe to call more
/// than once per process only the first time; subsequent calls return the
/// "logger already initialized" error wrapped as [`Fail::Invalid`].
pub fn init_logging(config: &Config) -> Result<(), Fail> {
    flexi_logger::Logger::with_str(&config.log_filter)
        .start()
        .map(|_| ())
        .map_err(|_| Fail::Invalid)
}
