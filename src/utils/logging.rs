// mongodumper/src/utils/logging.rs
use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info,aws_config=warn,aws_smithy_runtime=warn,aws_sdk_s3=warn";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Compact => builder.compact().with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}
