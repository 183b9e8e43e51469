//! Logging setup for the command line

use std::io::{self, IsTerminal};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Error, Result};

/// Filter directive for a verbosity level; `RUST_LOG` overrides it
pub fn filter_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "stagetrain=info,warn",
        1 => "stagetrain=debug,info",
        2 => "stagetrain=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let directive = filter_directive(verbosity, quiet);
    let env_filter = if quiet {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    let is_terminal = io::stdout().is_terminal();

    let result = if json_output {
        // JSON output for machine parsing
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).try_init()
    } else if is_terminal {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_ansi(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()
    } else {
        // Plain output for pipes and files
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    result.map_err(|e| Error::internal(format!("failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(0, false), "stagetrain=info,warn");
        assert_eq!(filter_directive(1, false), "stagetrain=debug,info");
        assert_eq!(filter_directive(5, false), "trace");
        assert_eq!(filter_directive(2, true), "error");
    }
}
