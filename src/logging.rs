//! Log output for hosts embedding the manager.

use std::env;

use tracing_subscriber::EnvFilter;

/// Directives for the manager's own output, consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "FDE_LOG";

fn default_directives(component: &str) -> String {
    format!("info,fde_manager=debug,{component}=debug")
}

/// First usable directive set among `FDE_LOG` and `RUST_LOG`, falling back
/// to debug output for the manager and `component`.
fn select_filter(fde_log: Option<String>, rust_log: Option<String>, component: &str) -> EnvFilter {
    [fde_log, rust_log]
        .into_iter()
        .flatten()
        .filter(|directives| !directives.trim().is_empty())
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives(component)))
}

/// Installs the global subscriber. Later calls keep the first one.
pub fn init_tracing(component: &str) {
    let filter = select_filter(
        env::var(LOG_ENV).ok(),
        env::var(EnvFilter::DEFAULT_ENV).ok(),
        component,
    );
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_directives_win_over_rust_log() {
        let filter = select_filter(Some("warn".into()), Some("trace".into()), "fdectl");
        assert_eq!(filter.to_string(), "warn");

        let filter = select_filter(
            Some("fde_manager=notalevel".into()),
            Some("error".into()),
            "fdectl",
        );
        assert_eq!(filter.to_string(), "error");
    }

    #[test]
    fn default_filter_covers_component() {
        let filter = select_filter(None, Some("  ".into()), "fdectl").to_string();
        assert!(filter.contains("fde_manager=debug"), "{filter}");
        assert!(filter.contains("fdectl=debug"), "{filter}");
    }

    #[test]
    fn repeated_init_keeps_first_subscriber() {
        init_tracing("fde-test");
        init_tracing("fde-test");
        tracing::debug!("tracing initialized twice");
    }
}
