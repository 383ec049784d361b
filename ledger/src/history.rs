// ledger/src/history.rs
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::{PurseAdapter, PurseError, Transaction};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A user's ledger, read lazily in creation order.
///
/// Pages are pulled from storage only as records are consumed. The walk can
/// be restarted with [`rewind`](Self::rewind) or resumed later from
/// [`cursor`](Self::cursor).
pub struct TransactionHistory {
    adapter: Arc<dyn PurseAdapter>,
    user_id: Uuid,
    page_size: usize,
    start: Option<Uuid>,
    cursor: Option<Uuid>,
    fetched_until: Option<Uuid>,
    buffer: VecDeque<Transaction>,
    exhausted: bool,
}

impl TransactionHistory {
    pub fn new(adapter: Arc<dyn PurseAdapter>, user_id: Uuid) -> Self {
        Self {
            adapter,
            user_id,
            page_size: DEFAULT_PAGE_SIZE,
            start: None,
            cursor: None,
            fetched_until: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Continue a previous walk after the record `cursor`.
    pub fn resume_after(mut self, cursor: Uuid) -> Self {
        self.start = Some(cursor);
        self.rewind();
        self
    }

    /// Id of the last record handed out.
    pub fn cursor(&self) -> Option<Uuid> {
        self.cursor
    }

    pub fn rewind(&mut self) {
        self.cursor = self.start;
        self.fetched_until = self.start;
        self.buffer.clear();
        self.exhausted = false;
    }

    pub async fn next(&mut self) -> Result<Option<Transaction>, PurseError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }

        let next = self.buffer.pop_front();
        if let Some(record) = &next {
            self.cursor = Some(record.id);
        }
        Ok(next)
    }

    /// Drain the rest of the walk. Unbounded; prefer [`next`](Self::next) for
    /// large histories.
    pub async fn collect_remaining(&mut self) -> Result<Vec<Transaction>, PurseError> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }

    async fn fill(&mut self) -> Result<(), PurseError> {
        let page = self
            .adapter
            .list_for_user(self.user_id, self.fetched_until, self.page_size)
            .await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.fetched_until = Some(last.id);
        }
        self.buffer.extend(page);
        Ok(())
    }
}
