use std::io::{IsTerminal as _, Write as _};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter,
};

/// Installs the global tracing subscriber. Logs go to journald under
/// `syslog_identifier` when running under systemd, to stderr otherwise.
/// `RUST_LOG` overrides the default `info` level.
pub fn try_init(
    syslog_identifier: &str,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    // No terminal on stderr means we are most likely a systemd unit.
    let journald_layer = if !std::io::stderr().is_terminal() {
        tracing_journald::layer()
            .inspect_err(|err| {
                eprintln!(
                    "failed connecting to journald socket. \
                    will write to stderr: {err}"
                );
            })
            .map(|layer| layer.with_syslog_identifier(syslog_identifier.to_owned()))
            .ok()
    } else {
        None
    };

    let stderr_layer = journald_layer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(journald_layer)
        .with(filter)
        .try_init()
}

pub fn flush() {
    std::io::stderr().flush().ok();
    std::io::stdout().flush().ok();
}
