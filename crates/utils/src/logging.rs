//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Human readable stderr layer honouring `RUST_LOG`.
pub fn get_fmt_layer<S>() -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter())
        .boxed()
}

/// Daily rolling file layer, keeps the last three files.
///
/// Returns `None` when the appender cannot be created, so the caller still gets
/// stderr output.
pub fn get_file_layer<S>(log_file: &Path) -> Option<(Box<dyn Layer<S> + Send + Sync>, WorkerGuard)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let dir = log_file.parent().unwrap_or(Path::new("."));
    let prefix = log_file.file_name()?.to_str()?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
        .ok()?;

    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(env_filter())
        .boxed();

    Some((file_layer, guard))
}

/// initiate the global tracing subscriber writing to stderr only
pub fn init() {
    registry().with(get_fmt_layer()).init();
}
