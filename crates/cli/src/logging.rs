use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

const TIMING_DIRECTIVE: &str = "docvl::timing=debug";

pub fn init(quiet: bool, timings: bool) {
    INIT.call_once(|| {
        if quiet {
            let filter = EnvFilter::new("error");
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
            return;
        }
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        if timings {
            if let Ok(directive) = TIMING_DIRECTIVE.parse() {
                filter = filter.add_directive(directive);
            }
        }
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    });
}
