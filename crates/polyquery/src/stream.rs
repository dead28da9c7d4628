//! Lazy, single-consumer row streams
//!
//! A [`ResultStream`] hides how rows are produced: an in-memory buffer, a
//! native row cursor, or a paged API walked through a [`PageSource`]. The
//! consumer only ever sees `has_next` / `next_row`.

use crate::error::{DataError, Result};
use crate::types::{Column, Row};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backend-native paged result set
///
/// Implemented by drivers whose client library hands out results one page at
/// a time. Dropping the source must release whatever the backend holds for it.
#[async_trait]
pub trait PageSource: Send {
    /// Result columns, known once the query has been accepted by the backend
    fn columns(&self) -> &[Column];

    /// Fetch the next page. `None` signals end of data, an empty page does not.
    async fn next_page(&mut self) -> Result<Option<Vec<Row>>>;
}

/// One-directional sequence of rows produced on demand
pub struct ResultStream {
    columns: Vec<Column>,
    rows: Option<BoxStream<'static, Result<Row>>>,
    peeked: Option<Result<Row>>,
    ctx: CancellationToken,
}

impl ResultStream {
    /// Wrap an arbitrary row stream
    pub fn new<S>(columns: Vec<Column>, rows: S, ctx: CancellationToken) -> Self
    where
        S: Stream<Item = Result<Row>> + Send + 'static,
    {
        Self {
            columns,
            rows: Some(rows.boxed()),
            peeked: None,
            ctx,
        }
    }

    /// Stream over rows that are already fully materialized
    pub fn from_rows(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self::new(
            columns,
            stream::iter(rows.into_iter().map(Ok)),
            CancellationToken::new(),
        )
    }

    /// Lazily walk every page of `source`, skipping empty pages
    pub fn from_pages(source: Box<dyn PageSource>, ctx: CancellationToken) -> Self {
        let columns = source.columns().to_vec();
        Self::new(columns, page_rows(source, Vec::new()), ctx)
    }

    /// Fetch pages until one holds at least one row (or the backend reports
    /// end of data), then continue lazily from there.
    pub async fn until_not_empty(
        mut source: Box<dyn PageSource>,
        ctx: CancellationToken,
    ) -> Result<Self> {
        let columns = source.columns().to_vec();
        let mut skipped = 0usize;

        loop {
            let page = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(DataError::Cancelled),
                page = source.next_page() => page?,
            };

            match page {
                Some(rows) if rows.is_empty() => skipped += 1,
                Some(rows) => {
                    debug!("First non-empty page after {} empty pages", skipped);
                    return Ok(Self::new(columns, page_rows(source, rows), ctx));
                }
                None => {
                    debug!("Query produced no rows after {} empty pages", skipped);
                    return Ok(Self::new(columns, stream::empty(), ctx));
                }
            }
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Whether another pull will produce a row or an error
    ///
    /// A backend failure is parked for the following [`next_row`](Self::next_row)
    /// and the underlying stream is released right away; the stream never
    /// resumes after a failure.
    pub async fn has_next(&mut self) -> bool {
        if self.peeked.is_some() {
            return true;
        }

        let Some(rows) = self.rows.as_mut() else {
            return false;
        };

        let item = tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Some(Err(DataError::Cancelled)),
            item = rows.next() => item,
        };

        match item {
            Some(Ok(row)) => {
                self.peeked = Some(Ok(row));
                true
            }
            Some(Err(e)) => {
                debug!("Result stream failed, releasing backend cursor: {}", e);
                self.rows = None;
                self.peeked = Some(Err(e));
                true
            }
            None => {
                self.rows = None;
                false
            }
        }
    }

    /// Produce the next row; fails with `ExhaustedStream` past the end
    pub async fn next_row(&mut self) -> Result<Row> {
        if !self.has_next().await {
            return Err(DataError::ExhaustedStream);
        }

        match self.peeked.take() {
            Some(item) => item,
            None => Err(DataError::ExhaustedStream),
        }
    }

    /// Release the backend cursor without draining it
    pub fn close(&mut self) {
        if self.rows.take().is_some() {
            debug!("Result stream closed before exhaustion");
        }
        self.peeked = None;
    }

    pub fn is_exhausted(&self) -> bool {
        self.rows.is_none() && self.peeked.is_none()
    }

    /// Drain every remaining row
    pub async fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while self.has_next().await {
            rows.push(self.next_row().await?);
        }
        Ok(rows)
    }

    /// Consume into a plain `Stream` for combinator-style consumers
    pub fn into_stream(self) -> impl Stream<Item = Result<Row>> + Send {
        stream::unfold(self, |mut rs| async move {
            if rs.has_next().await {
                let item = rs.next_row().await;
                Some((item, rs))
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("columns", &self.columns)
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}

fn page_rows(
    mut source: Box<dyn PageSource>,
    first: Vec<Row>,
) -> impl Stream<Item = Result<Row>> + Send + 'static {
    async_stream::try_stream! {
        for row in first {
            yield row;
        }

        while let Some(page) = source.next_page().await? {
            for row in page {
                yield row;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TestPages {
        columns: Vec<Column>,
        pages: VecDeque<Result<Vec<Row>>>,
        fetched: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    impl TestPages {
        fn new(pages: Vec<Result<Vec<Row>>>) -> Self {
            Self {
                columns: vec![Column::new("n", "int")],
                pages: pages.into(),
                fetched: Arc::new(AtomicUsize::new(0)),
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }

        fn paged(total: usize, page_size: usize) -> Self {
            let rows: Vec<Row> = (0..total).map(|i| vec![json!(i)]).collect();
            Self::new(rows.chunks(page_size).map(|c| Ok(c.to_vec())).collect())
        }
    }

    impl Drop for TestPages {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PageSource for TestPages {
        fn columns(&self) -> &[Column] {
            &self.columns
        }

        async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
            self.fetched.fetch_add(1, Ordering::SeqCst);
            self.pages.pop_front().transpose()
        }
    }

    async fn count(mut rs: ResultStream) -> usize {
        let mut n = 0;
        while rs.has_next().await {
            rs.next_row().await.unwrap();
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn test_row_count_matches_across_page_sizes() {
        for page_size in [1, 2, 3, 7, 10, 50] {
            let rs = ResultStream::from_pages(
                Box::new(TestPages::paged(10, page_size)),
                CancellationToken::new(),
            );
            assert_eq!(count(rs).await, 10, "page size {}", page_size);
        }
    }

    #[tokio::test]
    async fn test_empty_pages_are_skipped() {
        let pages = TestPages::new(vec![
            Ok(vec![]),
            Ok(vec![vec![json!(1)]]),
            Ok(vec![]),
            Ok(vec![]),
            Ok(vec![vec![json!(2)], vec![json!(3)]]),
        ]);
        let rs = ResultStream::from_pages(Box::new(pages), CancellationToken::new());
        let rows = rs.collect_rows().await.unwrap();
        assert_eq!(rows, vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]);
    }

    #[tokio::test]
    async fn test_until_not_empty_fetches_eagerly_then_lazily() {
        let pages = TestPages::new(vec![
            Ok(vec![]),
            Ok(vec![]),
            Ok(vec![vec![json!("a")]]),
            Ok(vec![vec![json!("b")]]),
        ]);
        let fetched = pages.fetched.clone();

        let mut rs = ResultStream::until_not_empty(Box::new(pages), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fetched.load(Ordering::SeqCst), 3);
        assert_eq!(rs.columns(), &[Column::new("n", "int")]);

        assert_eq!(rs.next_row().await.unwrap(), vec![json!("a")]);
        assert_eq!(rs.next_row().await.unwrap(), vec![json!("b")]);
        assert!(!rs.has_next().await);
    }

    #[tokio::test]
    async fn test_until_not_empty_with_no_rows() {
        let pages = TestPages::new(vec![Ok(vec![]), Ok(vec![])]);
        let mut rs = ResultStream::until_not_empty(Box::new(pages), CancellationToken::new())
            .await
            .unwrap();
        assert!(!rs.has_next().await);
        assert!(matches!(
            rs.next_row().await,
            Err(DataError::ExhaustedStream)
        ));
    }

    #[tokio::test]
    async fn test_error_is_reported_once_then_exhausted() {
        let pages = TestPages::new(vec![
            Ok(vec![vec![json!(1)]]),
            Err(DataError::backend_msg("cursor broken")),
            Ok(vec![vec![json!(2)]]),
        ]);
        let dropped = pages.dropped.clone();
        let mut rs = ResultStream::from_pages(Box::new(pages), CancellationToken::new());

        assert_eq!(rs.next_row().await.unwrap(), vec![json!(1)]);
        assert!(rs.has_next().await);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(matches!(
            rs.next_row().await,
            Err(DataError::BackendError { .. })
        ));

        assert!(!rs.has_next().await);
        assert!(matches!(
            rs.next_row().await,
            Err(DataError::ExhaustedStream)
        ));
    }

    #[tokio::test]
    async fn test_cancellation_releases_source() {
        let pages = TestPages::paged(100, 10);
        let dropped = pages.dropped.clone();
        let ctx = CancellationToken::new();
        let mut rs = ResultStream::from_pages(Box::new(pages), ctx.clone());

        assert!(rs.next_row().await.is_ok());
        ctx.cancel();

        assert!(matches!(rs.next_row().await, Err(DataError::Cancelled)));
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!rs.has_next().await);
    }

    #[tokio::test]
    async fn test_until_not_empty_respects_cancelled_context() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result =
            ResultStream::until_not_empty(Box::new(TestPages::paged(5, 1)), ctx).await;
        assert!(matches!(result, Err(DataError::Cancelled)));
    }

    #[tokio::test]
    async fn test_close_releases_source() {
        let pages = TestPages::paged(10, 5);
        let dropped = pages.dropped.clone();
        let mut rs = ResultStream::from_pages(Box::new(pages), CancellationToken::new());

        assert!(rs.has_next().await);
        rs.close();

        assert!(dropped.load(Ordering::SeqCst));
        assert!(rs.is_exhausted());
        assert!(matches!(
            rs.next_row().await,
            Err(DataError::ExhaustedStream)
        ));
    }

    #[tokio::test]
    async fn test_into_stream() {
        let rs = ResultStream::from_rows(
            vec![Column::new("k", "text")],
            vec![vec![json!("x")], vec![json!("y")]],
        );
        let rows: Vec<Row> = rs
            .into_stream()
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(rows.len(), 2);
    }
}
