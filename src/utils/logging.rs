use anyhow::{Result, Context};
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::{Path, PathBuf};
use std::fs;

fn env_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "harvester=debug" } else { "harvester=info" };
    Ok(EnvFilter::from_default_env()
        .add_directive(level.parse()?)
        .add_directive("warn".parse()?))
}

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let env_filter = env_filter(verbose)?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory: {}", parent.display()))?;
            }
        }

        let file = fs::File::create(log_file)
            .context(format!("Failed to create log file: {}", log_file.display()))?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    Ok(())
}

/// Create a default log file path
pub fn default_log_file() -> PathBuf {
    let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("org", "harvester", "harvester") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./logs")
    };

    path.push("harvester.log");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_parse() {
        assert!(env_filter(true).is_ok());
        assert!(env_filter(false).is_ok());
    }

    #[test]
    fn test_default_log_file_name() {
        assert_eq!(default_log_file().file_name().unwrap(), "harvester.log");
    }
}
