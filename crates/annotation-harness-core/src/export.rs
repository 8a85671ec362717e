//! Streaming export scan.
//!
//! [`RecordScan`] is a pull-based sequence over the index's search-after
//! scan: each `next_batch` call fetches one page, the optional `limit`
//! truncates the sequence to exactly that many records, and the live scan
//! cursor is released on every internal exit path (exhaustion, early limit,
//! scan failure). Callers that stop pulling early — a dropped connection —
//! must release the outstanding cursor themselves via [`RecordScan::release`]
//! or [`RecordScan::take_cursor`]; cursors are a bounded resource.
//!
//! The NDJSON wire framing lives here too: one self-terminated JSON line per
//! record, no enclosing array, byte-identical regardless of how records are
//! grouped into batches.

use std::sync::Arc;

use crate::error::Error;
use crate::index::RecordIndex;
use crate::models::{DatasetId, Record};
use crate::query::RecordQuery;

/// Default number of records fetched per scan page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// A pull-based scan over one dataset's matching records.
pub struct RecordScan {
    index: Arc<dyn RecordIndex>,
    dataset: DatasetId,
    query: RecordQuery,
    page_size: usize,
    /// Position for the next scan call: caller-supplied record id at first,
    /// then the cursor token of the previous page.
    position: Option<String>,
    /// Cursor currently held open on the index, if any.
    cursor: Option<String>,
    remaining: Option<u64>,
    done: bool,
}

impl RecordScan {
    pub fn new(
        index: Arc<dyn RecordIndex>,
        dataset: DatasetId,
        query: RecordQuery,
        after_id: Option<String>,
        limit: Option<u64>,
        page_size: usize,
    ) -> Self {
        Self {
            index,
            dataset,
            query: query.normalized(),
            page_size: page_size.max(1),
            position: after_id,
            cursor: None,
            remaining: limit,
            done: limit == Some(0),
        }
    }

    /// Fetch the next batch of records, or `None` when the scan is over.
    ///
    /// Batch size is an I/O concern only; consumers observe a flat record
    /// sequence. A scan error marks the sequence as faulted — subsequent
    /// calls return `None`.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Record>>, Error> {
        if self.done {
            return Ok(None);
        }

        let fetch = match self.remaining {
            Some(remaining) => self.page_size.min(remaining as usize),
            None => self.page_size,
        };
        let page = match self
            .index
            .scan(&self.dataset, &self.query, self.position.as_deref(), fetch)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                self.done = true;
                return Err(err.into());
            }
        };

        self.cursor = page.cursor.clone();
        self.position = page.cursor;
        if self.cursor.is_none() {
            self.done = true;
        }

        let mut records = page.records;
        if let Some(remaining) = self.remaining {
            let remaining = remaining as usize;
            if records.len() >= remaining {
                records.truncate(remaining);
                self.remaining = Some(0);
                self.done = true;
                // Early termination: free the server-side scan state now.
                self.release().await?;
            } else {
                self.remaining = Some((remaining - records.len()) as u64);
            }
        }

        if records.is_empty() {
            if !self.done {
                self.release().await?;
                self.done = true;
            }
            return Ok(None);
        }
        Ok(Some(records))
    }

    /// Release the outstanding scan cursor, if any. Idempotent.
    pub async fn release(&mut self) -> Result<(), Error> {
        if let Some(cursor) = self.cursor.take() {
            self.position = None;
            self.index.release_scan(&cursor).await?;
        }
        Ok(())
    }

    /// Detach the outstanding cursor so a caller can release it from a
    /// context where the scan itself is being dropped.
    pub fn take_cursor(&mut self) -> Option<String> {
        self.position = None;
        self.done = true;
        self.cursor.take()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Serialize one record as a self-terminated JSON line.
pub fn ndjson_line(record: &Record) -> Result<String, Error> {
    let mut line = serde_json::to_string(record)
        .map_err(|err| crate::error::IndexError::backend(err))?;
    line.push('\n');
    Ok(line)
}

/// Serialize a batch of records as concatenated JSON lines.
pub fn ndjson_frame(records: &[Record]) -> Result<String, Error> {
    let mut frame = String::new();
    for record in records {
        frame.push_str(&ndjson_line(record)?);
    }
    Ok(frame)
}
