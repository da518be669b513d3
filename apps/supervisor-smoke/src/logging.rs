//! Tracing bootstrap for the smoke binary. Output goes to stderr so stdout
//! carries hub frames only.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,session_runtime=debug,supervisor_smoke=debug";

/// Filter sources, first usable one wins.
const FILTER_VARS: [&str; 2] = ["RUST_LOG", "FLUXZAP_LOG"];

pub fn init() {
    let filter = select_filter(|key| env::var(key).ok());
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(filter)
        .try_init();
}

/// Blank or unparsable directives fall through to the next source.
fn select_filter<F>(mut lookup: F) -> EnvFilter
where
    F: FnMut(&str) -> Option<String>,
{
    FILTER_VARS
        .iter()
        .filter_map(|key| lookup(*key))
        .filter(|directives| !directives.trim().is_empty())
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
