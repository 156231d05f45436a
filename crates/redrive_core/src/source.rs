//! Deadline-aware wrapper over one paginated collaborator cursor.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Longest single wait a collaborator may be asked to block for, matching
/// the usual long-poll ceiling of queue protocols.
pub const MAX_PAGE_WAIT: Duration = Duration::from_secs(20);

/// A pull-based collaborator producing pages of work items.
///
/// Implementations own whatever continuation state the upstream protocol
/// requires (cursor, long-poll session, file offset); the wrapper only
/// bounds each individual call. An empty page means the cursor is exhausted.
#[async_trait]
pub trait PageFetch: Send {
    type Item: Send;

    /// Fetch the next page of at most `max_items` items, waiting at most
    /// `max_wait` for items to become available.
    async fn fetch(
        &mut self,
        max_items: usize,
        max_wait: Duration,
    ) -> Result<Vec<Self::Item>, crate::Error>;
}

/// One paginated cursor bound to a campaign deadline.
///
/// Keeps no page-to-page state of its own beyond the collaborator; it exists
/// so that no single page fetch can block past the shared deadline.
pub struct PagedSource<F> {
    fetcher: F,
    page_size: usize,
    deadline: Instant,
}

impl<F: PageFetch> PagedSource<F> {
    pub fn new(fetcher: F, page_size: usize, deadline: Instant) -> Self {
        Self {
            fetcher,
            page_size,
            deadline,
        }
    }

    /// The next page of work items.
    ///
    /// Returns an empty page without consulting the collaborator once the
    /// deadline has passed; otherwise clamps the collaborator's wait to the
    /// smaller of [`MAX_PAGE_WAIT`] and the remaining budget.
    pub async fn next_page(&mut self) -> Result<Vec<F::Item>, crate::Error> {
        let now = Instant::now();
        if self.deadline <= now {
            return Ok(Vec::new());
        }
        let wait = MAX_PAGE_WAIT.min(self.deadline.saturating_duration_since(now));
        self.fetcher.fetch(self.page_size, wait).await
    }
}
