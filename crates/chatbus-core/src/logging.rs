use tracing_subscriber::{fmt, EnvFilter};

use crate::{config::LogFormat, errors::Error, Result};

/// Initialize tracing for a backbone service.
///
/// Defaults to `info` for the workspace crates and `warn` for everything else;
/// `RUST_LOG` overrides. Fails if a global subscriber is already installed.
pub fn init(service_name: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let crate_name = service_name.replace('-', "_");
        EnvFilter::new(format!(
            "warn,chatbus=info,chatbus_core=info,chatbus_amqp=info,{crate_name}=info"
        ))
    });

    let builder = fmt().with_env_filter(filter).with_target(false);
    let installed = match format {
        LogFormat::Text => builder.with_ansi(true).try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    installed.map_err(|e| Error::External(format!("failed to install tracing subscriber: {e}")))
}
