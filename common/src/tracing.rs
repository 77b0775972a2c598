use std::sync::Once;

use tracing_subscriber::{filter::LevelFilter, EnvFilter};

static SLUICE_LOG_ENV_VAR: &str = "SLUICE_LOG";

/// List of crates in the workspace.
const SLUICE_CRATES: &[&str] = &["common", "storage", "orchestrator"];

pub fn register_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Parse directives from RUST_LOG
        let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
        let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
        let mut env_filter = log_filter.parse(&directive_string).unwrap();

        let sluice_log_level =
            std::env::var(SLUICE_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

        for crate_name in SLUICE_CRATES {
            // Add directives for each workspace crate, unless RUST_LOG overrides.
            if !directive_string.contains(&format!("{crate_name}=")) {
                env_filter = env_filter
                    .add_directive(format!("{crate_name}={sluice_log_level}").parse().unwrap());
            }
        }

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .init();
    });
}
