//! Fan-in of many paginated cursors into one work-item stream.
//!
//! Pagination protocols usually allow one outstanding request per cursor, so
//! a single cursor can never deliver faster than one page per round trip.
//! Racing many cursors and interleaving whatever arrives first is how a
//! campaign reaches throughput beyond that bound.

use futures::SinkExt;
use futures::channel::mpsc;
use futures::stream::Stream;

use crate::source::{PageFetch, PagedSource};

/// Merge `sources` into one finite stream of work items, interleaved by
/// arrival order.
///
/// Every source runs on its own task with its own in-flight page fetch, all
/// feeding one channel bounded at `buffer` items; the channel's receiver is
/// the merged stream. A source that reports an empty page is retired; the
/// stream terminates once every source has retired. The merge itself never
/// drops or duplicates an item.
///
/// A fetch failure is forwarded into the stream as an `Err` and retires the
/// failing source; the consumer decides whether that ends the campaign.
pub fn merge<F>(
    sources: Vec<PagedSource<F>>,
    buffer: usize,
) -> impl Stream<Item = Result<F::Item, crate::Error>>
where
    F: PageFetch + 'static,
    F::Item: 'static,
{
    let (tx, rx) = mpsc::channel(buffer);
    for (lane, mut source) in sources.into_iter().enumerate() {
        let mut tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match source.next_page().await {
                    Ok(page) if page.is_empty() => {
                        debug!(message = "Source exhausted.", lane);
                        break;
                    }
                    Ok(page) => {
                        for item in page {
                            if tx.send(Ok(item)).await.is_err() {
                                // Consumer went away; nothing left to feed.
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        warn!(message = "Source fetch failed.", lane, %error);
                        let _ = tx.send(Err(error)).await;
                        break;
                    }
                }
            }
        });
    }
    rx
}
