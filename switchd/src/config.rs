//! Command-line options for the agent.

use std::env;
use std::time::Duration;

use clap::Parser;

/// Reconciles datastore network state into the forwarding chip.
#[derive(Parser, Debug, Clone)]
#[command(name = "switchd")]
pub struct Options {
    /// Select-loop poll timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub poll_timeout_ms: u64,

    /// Platform identifier used by capacity heuristics. Defaults to the
    /// `platform` environment variable.
    #[arg(long)]
    pub platform: Option<String>,

    /// Raw object id of the switch to program.
    #[arg(long, default_value_t = 1)]
    pub switch_id: u64,

    /// Raw object id of the virtual router to program routes into.
    #[arg(long, default_value_t = 2)]
    pub virtual_router_id: u64,
}

impl Options {
    pub fn platform(&self) -> String {
        self.platform
            .clone()
            .or_else(|| env::var("platform").ok())
            .unwrap_or_default()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let options = Options::parse_from(["switchd"]);
        assert_eq!(options.poll_timeout(), Duration::from_secs(1));
        assert_eq!(options.switch_id, 1);
        assert_eq!(options.virtual_router_id, 2);
    }

    #[test]
    fn platform_flag_wins_over_environment() {
        let options = Options::parse_from(["switchd", "--platform", "vs"]);
        assert_eq!(options.platform(), "vs");
    }
}
