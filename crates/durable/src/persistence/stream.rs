//! Lazy, restartable task listing
//!
//! [`stream_tasks`] pages through a [`TaskStore`] on demand. Each yielded
//! task carries its `sequence`, so a consumer that stops can resume later by
//! passing the last sequence it saw.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};

use super::store::{ListQuery, StoreError, Task, TaskFilter, TaskStore};

struct Cursor {
    store: Arc<dyn TaskStore>,
    query: ListQuery,
    buffer: VecDeque<Task>,
    exhausted: bool,
}

/// Stream tasks matching `filter` in insertion order, `page_size` at a time
///
/// Nothing is fetched until the stream is polled. An error ends the stream
/// after being yielded.
pub fn stream_tasks(
    store: Arc<dyn TaskStore>,
    filter: TaskFilter,
    page_size: usize,
    after_sequence: Option<i64>,
) -> impl Stream<Item = Result<Task, StoreError>> + Send + 'static {
    let cursor = Cursor {
        store,
        query: ListQuery {
            filter,
            after_sequence,
            limit: page_size.max(1),
        },
        buffer: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(task) = cursor.buffer.pop_front() {
                return Some((Ok(task), cursor));
            }
            if cursor.exhausted {
                return None;
            }

            match cursor.store.list(&cursor.query).await {
                Ok(page) => {
                    if page.len() < cursor.query.limit {
                        cursor.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        cursor.query.after_sequence = Some(last.sequence);
                    }
                    cursor.buffer.extend(page);
                }
                Err(e) => {
                    cursor.exhausted = true;
                    return Some((Err(e), cursor));
                }
            }
        }
    })
}
