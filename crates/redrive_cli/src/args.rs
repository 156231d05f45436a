//! Command line surface of the `redrive` binary.

use std::path::PathBuf;

use clap::Parser;

/// Download or reprocess dead letters for an HTTP queue or delivery target.
///
/// Messages are printed to stdout as concatenated JSON, one per line unless
/// `--space` is given. Combining `--redrive` with `--log` switches delivery
/// to synchronous mode and writes each delivery's output to a file under the
/// given prefix. Note that `--redrive` can loop forever, endlessly
/// redriving, if the deliveries keep failing into the same dead letter
/// queue.
#[derive(Debug, Parser)]
#[command(name = "redrive", version)]
pub struct Args {
    /// Print and delete messages.
    #[arg(short = 'd', long)]
    pub drain: bool,

    /// Print, redrive and delete messages.
    #[arg(short = 'R', long)]
    pub redrive: bool,

    /// Log redrive output to files with the given prefix.
    #[arg(short = 'l', long, value_name = "PREFIX")]
    pub log: Option<String>,

    /// Pretty print with the given number of spaces.
    #[arg(short = 'S', long, value_name = "N", default_value_t = 0)]
    pub space: usize,

    /// Do not redrive messages containing the given pattern.
    #[arg(short = 'v', long, value_name = "PATTERN")]
    pub inverted_match: Option<String>,

    /// Issue the given number of messages per second.
    #[arg(short = 'w', long, value_name = "RATE", default_value_t = 10.0)]
    pub rate: f64,

    /// Run for the given number of seconds.
    #[arg(short = 't', long, value_name = "SECS", default_value_t = 1000)]
    pub time: u64,

    /// The url of the primary queue; its redrive policy names the dead
    /// letter queue to drain.
    #[arg(short = 'q', long, value_name = "URL")]
    pub queue_url: Option<String>,

    /// The url of the delivery target; its config names the dead letter
    /// queue to drain.
    #[arg(short = 'f', long, value_name = "URL")]
    pub target_url: Option<String>,

    /// Redrive messages drained to a log file.
    #[arg(short = 'i', long = "from-file", value_name = "FILE")]
    pub from_file: Option<PathBuf>,

    /// Number of concurrent receive cursors.
    #[arg(long, value_name = "N", default_value_t = 32)]
    pub fan_out: usize,

    /// Maximum messages per received page.
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub page_size: usize,
}

impl Args {
    /// Fill unset options from the environment.
    pub fn with_env_defaults(mut self) -> Self {
        if self.queue_url.is_none() {
            self.queue_url = std::env::var("REDRIVE_QUEUE_URL").ok();
        }
        if self.target_url.is_none() {
            self.target_url = std::env::var("REDRIVE_TARGET_URL").ok();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_full_flag_set() {
        let args = Args::try_parse_from([
            "redrive",
            "--redrive",
            "-w",
            "50",
            "-t",
            "120",
            "-f",
            "https://functions.example.com/orders",
            "-l",
            "logs/run-",
            "-v",
            "poison",
        ])
        .unwrap();

        assert!(args.redrive);
        assert!(!args.drain);
        assert_eq!(args.rate, 50.0);
        assert_eq!(args.time, 120);
        assert_eq!(
            args.target_url.as_deref(),
            Some("https://functions.example.com/orders")
        );
        assert_eq!(args.log.as_deref(), Some("logs/run-"));
        assert_eq!(args.inverted_match.as_deref(), Some("poison"));
        assert_eq!(args.fan_out, 32);
        assert_eq!(args.page_size, 10);
    }

    #[test]
    fn defaults_match_the_tool_conventions() {
        let args = Args::try_parse_from(["redrive"]).unwrap();
        assert_eq!(args.rate, 10.0);
        assert_eq!(args.time, 1000);
        assert_eq!(args.space, 0);
        assert!(!args.drain && !args.redrive);
    }
}
