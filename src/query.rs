//! Async query state machines for the UI layer.
//!
//! A `Query<T>` encapsulates one logical read: its fetching logic, the
//! idle/loading/success/error status, the current data, and the error object
//! when one applies. Results arrive on a channel and are drained by `poll()`
//! from the caller's tick loop, so rendering code never blocks.
//!
//! Reads keep showing the last-known-good data through a failure: an error
//! sets the status and the error object but leaves `data()` untouched, which
//! is what lets a screen render a banner over yesterday's entries instead of
//! going blank.

use futures::future::BoxFuture;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::records::{Entry, EntryPage};

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  Idle,
  Loading,
  Success,
  Error,
}

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

/// A single-value query.
pub struct Query<T> {
  status: QueryStatus,
  data: Option<T>,
  error: Option<ApiError>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, ApiError>>>,
  fetched_at: Option<Instant>,
  stale_time: Duration,
}

impl<T: Send + 'static> Query<T> {
  /// Create a query with the given fetcher. The fetcher is called once per
  /// `fetch()`/`refetch()`.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      fetcher: Box::new(move || Box::pin(fetcher())),
      receiver: None,
      fetched_at: None,
      stale_time: Duration::from_secs(60),
    }
  }

  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.error.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  /// Whether successful data has outlived its stale time.
  pub fn is_stale(&self) -> bool {
    match self.status {
      QueryStatus::Success => self
        .fetched_at
        .map(|t| t.elapsed() > self.stale_time)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching unless a fetch is already in flight.
  pub fn fetch(&mut self) {
    if self.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Force a new fetch, superseding any pending one.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.start_fetch();
  }

  /// Drain a pending result. Returns true when the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(data)) => {
        self.status = QueryStatus::Success;
        self.data = Some(data);
        self.error = None;
        self.fetched_at = Some(Instant::now());
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        // Keep the last-known-good data; the caller renders it alongside
        // the error.
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.status = QueryStatus::Error;
        self.error = Some(ApiError::network("query was cancelled"));
        self.receiver = None;
        true
      }
    }
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.status = QueryStatus::Loading;

    let future = (self.fetcher)();
    tokio::spawn(async move {
      let result = future.await;
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("status", &self.status)
      .field("data", &self.data)
      .field("error", &self.error)
      .finish_non_exhaustive()
  }
}

type PageFetcherFn =
  Box<dyn Fn(Option<String>) -> BoxFuture<'static, Result<EntryPage, ApiError>> + Send + Sync>;

/// A cursor-paginated listing query. `fetch()` loads the first page,
/// `fetch_next_page()` appends while `has_more()`.
pub struct ListQuery {
  status: QueryStatus,
  items: Vec<Entry>,
  cursor: Option<String>,
  has_more: bool,
  error: Option<ApiError>,
  fetcher: PageFetcherFn,
  receiver: Option<mpsc::UnboundedReceiver<PageResult>>,
}

struct PageResult {
  appending: bool,
  result: Result<EntryPage, ApiError>,
}

impl ListQuery {
  /// The fetcher receives the cursor to continue from (`None` for the first
  /// page).
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<EntryPage, ApiError>> + Send + 'static,
  {
    Self {
      status: QueryStatus::Idle,
      items: Vec::new(),
      cursor: None,
      has_more: false,
      error: None,
      fetcher: Box::new(move |cursor| Box::pin(fetcher(cursor))),
      receiver: None,
    }
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  pub fn items(&self) -> &[Entry] {
    &self.items
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.error.as_ref()
  }

  pub fn has_more(&self) -> bool {
    self.has_more
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  /// Load the first page unless already loading.
  pub fn fetch(&mut self) {
    if self.is_loading() {
      return;
    }
    self.start_fetch(None, false);
  }

  /// Load the next page, appending to the current items. No-op while loading
  /// or when the listing is exhausted.
  pub fn fetch_next_page(&mut self) {
    if self.is_loading() || !self.has_more {
      return;
    }
    self.start_fetch(self.cursor.clone(), true);
  }

  /// Restart from the first page, superseding any pending fetch.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.start_fetch(None, false);
  }

  /// Drain a pending result. Returns true when the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(PageResult {
        appending,
        result: Ok(page),
      }) => {
        if appending {
          self.items.extend(page.items);
        } else {
          self.items = page.items;
        }
        self.cursor = page.cursor;
        self.has_more = page.has_more;
        self.status = QueryStatus::Success;
        self.error = None;
        self.receiver = None;
        true
      }
      Ok(PageResult {
        result: Err(error), ..
      }) => {
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.status = QueryStatus::Error;
        self.error = Some(ApiError::network("query was cancelled"));
        self.receiver = None;
        true
      }
    }
  }

  fn start_fetch(&mut self, cursor: Option<String>, appending: bool) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.status = QueryStatus::Loading;

    let future = (self.fetcher)(cursor);
    tokio::spawn(async move {
      let result = future.await;
      let _ = tx.send(PageResult { appending, result });
    });
  }
}
