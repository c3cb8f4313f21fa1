//! Log setup from the configuration surface
//!
//! Maps the config's `log_file` / `log_level` pair onto a
//! `tracing-subscriber` installation. Logging is disabled when either
//! value is empty, mirroring the host middleware this crate grew out of.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt;

use crate::config::PathConfig;
use crate::error::{EsiError, Result};

/// Install the global subscriber for a path scope's log settings.
///
/// `log_level` accepts `debug`, `info` and `fatal` (mapped to error);
/// `log_file` accepts `stderr`, `stdout` or a file path opened in append
/// mode. An unopenable file is `Fatal`. Installing twice is harmless: the
/// first subscriber wins, matching process-wide logging semantics.
pub fn setup(config: &PathConfig) -> Result<()> {
    let level = match config.log_level.as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "fatal" => Level::ERROR,
        _ => return Ok(()), // logging disabled
    };

    match config.log_file.as_str() {
        "" => Ok(()), // logging disabled
        "stderr" => {
            let _ = fmt()
                .with_max_level(level)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
            Ok(())
        }
        "stdout" => {
            let _ = fmt()
                .with_max_level(level)
                .with_target(false)
                .with_writer(std::io::stdout)
                .try_init();
            Ok(())
        }
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    EsiError::Fatal(format!("cannot open log file {:?}: {}", path, e))
                })?;
            let _ = fmt()
                .with_max_level(level)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_when_unset() {
        let config = PathConfig::default();
        assert!(setup(&config).is_ok());
    }

    #[test]
    fn test_unopenable_log_file_is_fatal() {
        let config = PathConfig {
            log_file: "/definitely/not/a/dir/esi.log".into(),
            log_level: "debug".into(),
            ..PathConfig::default()
        };
        assert!(setup(&config).unwrap_err().is_fatal());
    }

    #[test]
    fn test_stderr_setup_is_idempotent() {
        let config = PathConfig {
            log_file: "stderr".into(),
            log_level: "info".into(),
            ..PathConfig::default()
        };
        assert!(setup(&config).is_ok());
        assert!(setup(&config).is_ok());
    }
}
