//! Campaign orchestration: pull merged work items, pace their delivery,
//! wait for the whole fleet to drain.

use std::future::Future;
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use metrics::histogram;
use snafu::Snafu;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::pacing::{InvokeError, PacingController};

/// Why a campaign stopped early.
///
/// Each variant carries its cause unwrapped, so a caller can always tell a
/// budget exhaustion from an upstream fetch failure from a delivery failure.
#[derive(Debug, Snafu)]
pub enum CampaignError {
    /// A page fetch failed; the merged stream was cut short.
    #[snafu(display("work item source failed: {source}"))]
    Source { source: crate::Error },

    /// A paced delivery gave up before the deadline.
    #[snafu(display("paced delivery failed: {source}"))]
    Delivery { source: InvokeError<crate::Error> },

    /// Retiring a short-circuited work item failed.
    #[snafu(display("retiring an excluded work item failed: {source}"))]
    Retire { source: crate::Error },

    /// A scheduled task panicked or was cancelled out from under us.
    #[snafu(display("campaign task failed: {source}"))]
    Task { source: tokio::task::JoinError },
}

/// Final accounting for a campaign that drained completely.
#[derive(Debug, Clone, Copy)]
pub struct CampaignReport {
    /// Items delivered through the pacing controller.
    pub accepted: u64,
    /// Items short-circuited by the exclusion predicate.
    pub skipped: u64,
    /// Wall-clock duration from first pull to full drain.
    pub elapsed: Duration,
}

impl CampaignReport {
    /// Observed end-to-end throughput in items per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            (self.accepted + self.skipped) as f64 / secs
        }
    }
}

/// Drive one campaign to completion.
///
/// Pulls `items` to exhaustion, scheduling every accepted item as a paced
/// `operation` call without waiting for the previous one to finish; items
/// matching `exclude` bypass the controller entirely and are handed to
/// `on_excluded` (acknowledge-without-delivery). Once the stream ends, waits
/// for every outstanding task before reporting.
///
/// The first terminal failure aborts the campaign; work already dispatched
/// is left to finish on its own rather than cancelled mid-flight.
pub async fn drive<St, T, Excl, Skip, SkipFut, Op, OpFut>(
    mut items: St,
    controller: PacingController,
    exclude: Excl,
    on_excluded: Skip,
    operation: Op,
) -> Result<CampaignReport, CampaignError>
where
    St: Stream<Item = Result<T, crate::Error>> + Unpin,
    T: Clone + Send + Sync + 'static,
    Excl: Fn(&T) -> bool,
    Skip: Fn(T) -> SkipFut,
    SkipFut: Future<Output = Result<(), crate::Error>> + Send + 'static,
    Op: Fn(T, f64) -> OpFut + Clone + Send + Sync + 'static,
    OpFut: Future<Output = Result<(), crate::Error>> + Send + 'static,
{
    let start = Instant::now();
    let mut tasks: JoinSet<Result<(), CampaignError>> = JoinSet::new();
    let mut accepted = 0u64;
    let mut skipped = 0u64;

    while let Some(next) = items.next().await {
        let item = match next {
            Ok(item) => item,
            Err(source) => {
                tasks.detach_all();
                return Err(CampaignError::Source { source });
            }
        };
        if exclude(&item) {
            skipped += 1;
            let retire = on_excluded(item);
            tasks.spawn(async move {
                retire
                    .await
                    .map_err(|source| CampaignError::Retire { source })
            });
        } else {
            accepted += 1;
            let controller = controller.clone();
            let operation = operation.clone();
            tasks.spawn(async move {
                controller
                    .invoke(move |rate| operation(item.clone(), rate))
                    .await
                    .map_err(|source| CampaignError::Delivery { source })
            });
        }
        histogram!("campaign_in_flight").record(tasks.len() as f64);
    }

    debug!(
        message = "Work item stream drained; waiting for in-flight deliveries.",
        accepted, skipped
    );
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tasks.detach_all();
                return Err(error);
            }
            Err(source) => {
                tasks.detach_all();
                return Err(CampaignError::Task { source });
            }
        }
    }

    let report = CampaignReport {
        accepted,
        skipped,
        elapsed: start.elapsed(),
    };
    info!(
        message = "Campaign drained.",
        accepted = report.accepted,
        skipped = report.skipped,
        throughput_per_sec = report.throughput()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use futures::stream;
    use tokio::time;

    use super::*;
    use crate::pacing::PacingSettings;

    fn controller(budget_ms: u64) -> PacingController {
        PacingController::new(
            PacingSettings::builder()
                .increase_per_success(0.1)
                .decrease_ratio(0.5)
                .initial_rate(1.0)
                .deadline(Instant::now() + Duration::from_millis(budget_ms))
                .build(),
        )
    }

    fn ok_items(ids: impl IntoIterator<Item = u64>) -> impl Stream<Item = Result<u64, crate::Error>> + Unpin {
        stream::iter(ids.into_iter().map(Ok).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn delivers_every_item_and_reports_counts() {
        time::pause();

        let delivered = Arc::new(AtomicU64::new(0));
        let op = {
            let delivered = Arc::clone(&delivered);
            move |_item: u64, _rate: f64| {
                let delivered = Arc::clone(&delivered);
                async move {
                    delivered.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };

        let report = drive(
            ok_items(0..25),
            controller(3_600_000),
            |_| false,
            |_item| async { Ok(()) },
            op,
        )
        .await
        .unwrap();

        assert_eq!(report.accepted, 25);
        assert_eq!(report.skipped, 0);
        assert_eq!(delivered.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn excluded_items_bypass_the_controller() {
        time::pause();

        let delivered = Arc::new(AtomicU64::new(0));
        let retired = Arc::new(AtomicU64::new(0));
        let op = {
            let delivered = Arc::clone(&delivered);
            move |_item: u64, _rate: f64| {
                let delivered = Arc::clone(&delivered);
                async move {
                    delivered.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };
        let on_excluded = {
            let retired = Arc::clone(&retired);
            move |_item: u64| {
                let retired = Arc::clone(&retired);
                async move {
                    retired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };

        let report = drive(
            ok_items(0..10),
            controller(3_600_000),
            |item| item % 2 == 0,
            on_excluded,
            op,
        )
        .await
        .unwrap();

        assert_eq!(report.accepted, 5);
        assert_eq!(report.skipped, 5);
        assert_eq!(delivered.load(Ordering::SeqCst), 5);
        assert_eq!(retired.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn a_source_failure_aborts_the_campaign() {
        time::pause();

        let items: Vec<Result<u64, crate::Error>> =
            vec![Ok(1), Err("receive failed".into()), Ok(2)];
        let result = drive(
            stream::iter(items),
            controller(3_600_000),
            |_| false,
            |_item| async { Ok(()) },
            |_item: u64, _rate: f64| async { Ok(()) },
        )
        .await;

        assert!(matches!(result, Err(CampaignError::Source { .. })));
    }

    #[tokio::test]
    async fn a_delivery_failure_surfaces_its_original_cause() {
        time::pause();

        let result = drive(
            ok_items([1]),
            controller(10),
            |_| false,
            |_item| async { Ok(()) },
            |_item: u64, _rate: f64| async { Err::<(), crate::Error>("delivery refused".into()) },
        )
        .await;

        match result {
            Err(CampaignError::Delivery { source }) => {
                let cause = source.into_operation_error().expect("operation failure");
                assert_eq!(cause.to_string(), "delivery refused");
            }
            other => panic!("expected a delivery failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn an_exhausted_budget_surfaces_as_deadline_exceeded() {
        time::pause();

        let result = drive(
            ok_items([1]),
            controller(0),
            |_| false,
            |_item| async { Ok(()) },
            |_item: u64, _rate: f64| async { Ok(()) },
        )
        .await;

        match result {
            Err(CampaignError::Delivery { source }) => assert!(source.is_deadline()),
            other => panic!("expected a deadline failure, got {other:?}"),
        }
    }
}
