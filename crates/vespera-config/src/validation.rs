use crate::diagnostics::{ConfigValidationError, ConfigWarning, ValidationDiagnostics};
use crate::{LoggingConfig, VesperaConfig};

impl VesperaConfig {
    /// Validate semantic invariants for a configuration.
    ///
    /// Reports every problem found in one pass.
    #[must_use]
    pub fn validate(&self) -> ValidationDiagnostics {
        let mut out = ValidationDiagnostics::default();

        validate_debounce(self, &mut out);
        validate_scheduler(self, &mut out);
        validate_logging(self, &mut out);

        out
    }
}

fn validate_debounce(config: &VesperaConfig, out: &mut ValidationDiagnostics) {
    if config.debounce.delay_ms == 0 {
        out.errors.push(ConfigValidationError::InvalidValue {
            toml_path: "debounce.delay_ms".to_string(),
            message: "must be >= 1".to_string(),
        });
    }
}

fn validate_scheduler(config: &VesperaConfig, out: &mut ValidationDiagnostics) {
    let threads = [
        ("scheduler.compute_threads", config.scheduler.compute_threads),
        (
            "scheduler.background_threads",
            config.scheduler.background_threads,
        ),
        ("scheduler.io_threads", config.scheduler.io_threads),
    ];

    for (toml_path, value) in threads {
        if value == Some(0) {
            out.errors.push(ConfigValidationError::InvalidValue {
                toml_path: toml_path.to_string(),
                message: "must be >= 1".to_string(),
            });
        }
    }
}

fn validate_logging(config: &VesperaConfig, out: &mut ValidationDiagnostics) {
    let normalized = LoggingConfig::normalize_level_directives(&config.logging.level);
    if !config.logging.level.trim().is_empty()
        && tracing_subscriber::EnvFilter::try_new(normalized.clone()).is_err()
    {
        out.warnings.push(ConfigWarning::LoggingLevelInvalid {
            value: config.logging.level.clone(),
            normalized,
        });
    }
}
