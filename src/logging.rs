//! Tracing subscriber setup for hosts embedding the crate

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::errors::{VfsError, VfsResult};

/// Filter directive for a verbosity count (0 = errors only, 4+ = trace)
fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Install a stderr subscriber. `RUST_LOG` overrides `verbosity`.
///
/// Fails with [`VfsError::Config`] if a global subscriber is already set.
pub fn init_logging(verbosity: u8) -> VfsResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bark_vfs={}", level_for(verbosity))));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(verbosity >= 3)
                .with_line_number(verbosity >= 3),
        )
        .try_init()
        .map_err(|e| VfsError::Config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for() {
        assert_eq!(level_for(0), "error");
        assert_eq!(level_for(2), "info");
        assert_eq!(level_for(9), "trace");
    }

    #[test]
    fn test_second_init_is_an_error() {
        // The first call may already have happened in another test
        let _ = init_logging(1);
        assert!(matches!(init_logging(1), Err(VfsError::Config(_))));
    }
}
