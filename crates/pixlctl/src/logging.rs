//! Logging setup shared by every subcommand.

/// Flags controlling log verbosity and rendering. These match the knobs the
/// containerised deployment sets through the environment.
#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// The log verbosity. Can be one of trace|debug|info|warn|error|off.
    #[arg(
        long = "log.level",
        env = "PIXL_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    pub level: String,

    #[arg(long = "log.format", value_enum, global = true)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
pub enum LogFormat {
    /// One JSON object per line on stderr; what log shippers ingest.
    Json,
    /// Plain text with no colors.
    Text,
    /// Plain text with colors for interactive terminals.
    Color,
}

fn default_log_format() -> LogFormat {
    if atty::is(atty::Stream::Stderr) {
        LogFormat::Color
    } else {
        // Non-interactive runs default to JSON so programmatic users don't
        // have to ask for it.
        LogFormat::Json
    }
}

/// Initializes logging from the given args. Panics if called twice.
pub fn init_logging(args: &LogArgs) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(args.level.as_str())
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(false);

    match args.format.unwrap_or_else(default_log_format) {
        LogFormat::Json => {
            builder
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .init();
        }
        LogFormat::Text => {
            builder.compact().with_ansi(false).init();
        }
        LogFormat::Color => {
            builder.compact().with_ansi(true).init();
        }
    }
}
