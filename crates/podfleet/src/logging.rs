use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// Logs go to stderr and to a daily rolling file at `log_file`. The returned
/// guard flushes the file writer and must live until the process exits.
pub fn init(log_file: &Path) -> Option<WorkerGuard> {
    let fmt_layer = utils::logging::get_fmt_layer();

    match utils::logging::get_file_layer(log_file) {
        Some((file_layer, guard)) => {
            registry().with(fmt_layer).with(file_layer).init();
            Some(guard)
        }
        None => {
            registry().with(fmt_layer).init();
            tracing::warn!(log_file = %log_file.display(), "Cannot write run log, logging to stderr only");
            None
        }
    }
}
