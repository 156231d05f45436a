//! `redrive`: download or reprocess dead letters for an HTTP queue or
//! delivery target.
//!
//! The tool drains a dead letter queue through many concurrent receive
//! cursors, prints every message as concatenated JSON, and (optionally)
//! redrives each one through an AIMD-paced delivery that adapts its issue
//! rate to what the downstream target sustains, all bounded by one campaign
//! deadline. Diagnostics go to stderr via `tracing`; stdout carries only
//! message JSON.

mod args;
mod queue;
mod replay;
mod target;

#[macro_use]
extern crate tracing;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use futures::stream::BoxStream;
use indicatif::{ProgressBar, ProgressStyle};
use redrive_core::campaign::{self, CampaignReport};
use redrive_core::merge::merge;
use redrive_core::pacing::{PacingController, PacingSettings};
use redrive_core::source::PagedSource;
use serde::Serialize;
use snafu::OptionExt;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use crate::args::Args;
use crate::queue::{Message, QueueClient, QueueCursor};
use crate::replay::FileReplay;
use crate::target::{InvocationMode, TargetClient};

type Error = redrive_core::Error;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse().with_env_defaults();
    match run(args).await {
        Ok(report) => {
            info!(
                message = "Done.",
                accepted = report.accepted,
                skipped = report.skipped,
                throughput_per_sec = report.throughput()
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(message = "Campaign failed.", %error);
            ExitCode::from(2)
        }
    }
}

/// Where accepted messages are redriven to.
enum Destination {
    Target {
        client: TargetClient,
        mode: InvocationMode,
    },
    Queue(QueueClient),
}

async fn run(args: Args) -> Result<CampaignReport, Error> {
    if args.queue_url.is_none() && args.target_url.is_none() && args.from_file.is_none() {
        return Err("one of --queue-url, --target-url or --from-file is required".into());
    }
    let rate_per_ms = args.rate / 1_000.0;
    if !rate_per_ms.is_finite() || rate_per_ms <= 0.0 {
        return Err("--rate must be positive".into());
    }

    // Deadline for starting a delivery, shared by every component.
    let deadline = Instant::now() + Duration::from_secs(args.time);
    let http = reqwest::Client::new();

    // Resolve the dead letter queue being drained and the redrive
    // destination. With --from-file there is nothing to drain or delete.
    let mut dlq: Option<QueueClient> = None;
    let mut destination: Option<Destination> = None;
    let mut target_timeout = Duration::ZERO;

    if let Some(url) = &args.target_url {
        let client = TargetClient::new(http.clone(), url.as_str());
        let config = client.config().await?;
        target_timeout = Duration::from_millis(config.timeout_ms.unwrap_or(10_000));
        if args.from_file.is_none() {
            let dlq_url = config
                .dead_letter_queue_url
                .clone()
                .context(target::NoDeadLetterQueueSnafu { url: url.as_str() })?;
            dlq = Some(QueueClient::new(http.clone(), dlq_url));
        }
        let mode = if args.log.is_some() {
            InvocationMode::RequestResponse
        } else {
            InvocationMode::Event
        };
        let client = client.with_request_timeout(target_timeout + Duration::from_secs(1));
        destination = Some(Destination::Target { client, mode });
    } else if let Some(url) = &args.queue_url {
        let primary = QueueClient::new(http.clone(), url.as_str());
        if args.from_file.is_none() {
            let attributes = primary.attributes().await?;
            if let Some(ms) = attributes.default_visibility_timeout_ms {
                target_timeout = Duration::from_millis(ms);
            }
            let policy = attributes
                .redrive_policy
                .context(queue::NoRedrivePolicySnafu { url: url.as_str() })?;
            let dlq_url = policy
                .dead_letter_target_url
                .context(queue::NoDeadLetterTargetSnafu { url: url.as_str() })?;
            dlq = Some(QueueClient::new(http.clone(), dlq_url));
        }
        destination = Some(Destination::Queue(primary));
    }

    if args.redrive && destination.is_none() {
        return Err("--redrive needs --target-url or --queue-url to deliver to".into());
    }
    if let Some(prefix) = &args.log {
        if let Some(parent) = Path::new(prefix).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
    }

    let page_size = args.page_size.max(1);
    let items: BoxStream<'static, Result<Message, Error>> = if let Some(path) = &args.from_file {
        let replay = FileReplay::open(path).await?;
        merge(vec![PagedSource::new(replay, page_size, deadline)], page_size).boxed()
    } else {
        let dlq = dlq.clone().ok_or_else(|| Error::from("no dead letter queue to drain"))?;
        // An in-flight message must stay invisible for the whole campaign
        // plus one delivery, or it would be handed out twice.
        let visibility = Duration::from_secs(args.time) + target_timeout;
        let fan_out = args.fan_out.max(1);
        info!(
            message = "Draining dead letter queue.",
            queue = dlq.url(),
            fan_out,
            rate_per_sec = args.rate
        );
        let sources = (0..fan_out)
            .map(|_| PagedSource::new(QueueCursor::new(dlq.clone(), visibility), page_size, deadline))
            .collect();
        merge(sources, fan_out * page_size).boxed()
    };

    let controller = PacingController::new(
        PacingSettings::builder()
            .increase_per_success(rate_per_ms / 20.0)
            .decrease_ratio(0.5)
            .initial_rate(rate_per_ms)
            .deadline(deadline)
            .build(),
    );

    let progress = ProgressBar::new(0)
        .with_style(ProgressStyle::with_template(
            "[{elapsed_precise}] {wide_bar} {pos}/{len} ({msg})",
        )?);

    let handlers = Arc::new(Handlers {
        dlq,
        destination,
        drain: args.drain,
        redrive: args.redrive,
        space: args.space,
        log_prefix: args.log.clone(),
        progress: progress.clone(),
        settled: AtomicU64::new(0),
        started: Instant::now(),
        target_rate_per_sec: args.rate,
    });

    let exclude = {
        let pattern = args.inverted_match.clone();
        move |message: &Message| matches_pattern(message, pattern.as_deref())
    };
    let on_excluded = {
        let handlers = Arc::clone(&handlers);
        move |message: Message| {
            let handlers = Arc::clone(&handlers);
            async move { handlers.skip(message).await }
        }
    };
    let operation = {
        let handlers = Arc::clone(&handlers);
        move |message: Message, rate: f64| {
            let handlers = Arc::clone(&handlers);
            async move { handlers.handle(&message, rate).await }
        }
    };

    let items = items
        .inspect({
            let progress = progress.clone();
            move |_| progress.inc_length(1)
        })
        .boxed();

    let result = campaign::drive(items, controller, exclude, on_excluded, operation).await;
    progress.finish();
    Ok(result?)
}

/// Everything a per-message handler needs, shared by all in-flight tasks.
struct Handlers {
    dlq: Option<QueueClient>,
    destination: Option<Destination>,
    drain: bool,
    redrive: bool,
    space: usize,
    log_prefix: Option<String>,
    progress: ProgressBar,
    settled: AtomicU64,
    started: Instant,
    target_rate_per_sec: f64,
}

impl Handlers {
    /// One paced delivery attempt: print, then redrive or drain.
    async fn handle(&self, message: &Message, rate: f64) -> Result<(), Error> {
        println!("{}", render(message, false, self.space)?);
        if self.redrive {
            self.deliver(message).await?;
        } else if self.drain {
            self.retire(message).await?;
        }
        self.tick(Some(rate));
        Ok(())
    }

    /// Short-circuit path for excluded messages: print and acknowledge.
    async fn skip(&self, message: Message) -> Result<(), Error> {
        println!("{}", render(&message, true, self.space)?);
        self.retire(&message).await?;
        self.tick(None);
        Ok(())
    }

    async fn deliver(&self, message: &Message) -> Result<(), Error> {
        match &self.destination {
            Some(Destination::Target { client, mode }) => {
                let delivery = client.deliver(message, *mode).await?;
                if let Some(prefix) = &self.log_prefix {
                    target::write_delivery_log(prefix, message, &delivery).await?;
                }
                // A handler failure leaves the message in the queue for the
                // next campaign.
                if delivery.handler_error.is_none() {
                    self.retire(message).await?;
                }
            }
            Some(Destination::Queue(primary)) => {
                let forwarded_id = primary.send(message).await?;
                if let Some(prefix) = &self.log_prefix {
                    target::write_forward_log(prefix, message, &forwarded_id).await?;
                }
                self.retire(message).await?;
            }
            None => {}
        }
        Ok(())
    }

    async fn retire(&self, message: &Message) -> Result<(), Error> {
        if let (Some(dlq), Some(receipt)) = (&self.dlq, &message.receipt_handle) {
            dlq.delete(receipt).await?;
        }
        Ok(())
    }

    fn tick(&self, rate_per_ms: Option<f64>) {
        let settled = self.settled.fetch_add(1, Ordering::Relaxed) + 1;
        let elapsed = self.started.elapsed().as_secs_f64();
        let actual = if elapsed > 0.0 {
            settled as f64 / elapsed
        } else {
            0.0
        };
        let target = rate_per_ms.map_or(self.target_rate_per_sec, |rate| rate * 1_000.0);
        self.progress
            .set_message(format!("actual {actual:.1}/s, target {target:.1}/s"));
        self.progress.inc(1);
    }
}

/// True when the message's JSON rendering contains `pattern`.
fn matches_pattern(message: &Message, pattern: Option<&str>) -> bool {
    match pattern {
        Some(pattern) => serde_json::to_string(message)
            .map(|json| json.contains(pattern))
            .unwrap_or(false),
        None => false,
    }
}

/// Render one message as a JSON line, tagged with whether it was skipped.
fn render(message: &Message, skipped: bool, space: usize) -> Result<String, Error> {
    let mut value = serde_json::to_value(message)?;
    value["skipped"] = serde_json::Value::Bool(skipped);
    if space == 0 {
        return Ok(serde_json::to_string(&value)?);
    }
    let indent = " ".repeat(space);
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(out)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> Message {
        Message {
            message_id: "m-1".to_string(),
            body: body.to_string(),
            receipt_handle: Some("r-1".to_string()),
            attributes: serde_json::Map::new(),
        }
    }

    #[test]
    fn renders_compact_json_with_skip_marker() {
        let line = render(&message("{\"order\":17}"), false, 0).unwrap();
        assert!(line.contains("\"message_id\":\"m-1\""));
        assert!(line.contains("\"skipped\":false"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn renders_pretty_json_when_space_is_given() {
        let line = render(&message("{}"), true, 4).unwrap();
        assert!(line.contains("\n    \"skipped\": true"));
    }

    #[test]
    fn pattern_matching_covers_the_whole_rendered_message() {
        let message = message("{\"customer\":\"acme\"}");
        assert!(matches_pattern(&message, Some("acme")));
        assert!(matches_pattern(&message, Some("m-1")));
        assert!(!matches_pattern(&message, Some("globex")));
        assert!(!matches_pattern(&message, None));
    }
}
