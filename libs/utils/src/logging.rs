//! Process-wide `tracing` initialization.

use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Plain
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("unknown log format '{s}', expected 'plain' or 'json'"),
        }
    }
}

/// Installs the global `tracing` subscriber. Must be called exactly once,
/// as early in `main` as possible so that nothing before it silently logs
/// through the default no-op subscriber.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_error::ErrorLayer::default());

    match format {
        LogFormat::Plain => {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()?;
        }
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_target(false))
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_sensitively() {
        assert_eq!("plain".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("PLAIN".parse::<LogFormat>().is_err());
    }
}
