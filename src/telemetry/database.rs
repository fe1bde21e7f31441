//! Timing and tracing of large-tier cache queries.

use std::time::{Duration, Instant};

use tracing::{Instrument, debug, info_span, warn};

/// Queries slower than this are reported at warn level.
const SLOW_QUERY: Duration = Duration::from_millis(250);

/// Identifies a cache query in spans: what ran, for which namespace and
/// collection.
#[derive(Debug, Clone, Copy)]
pub struct CacheQuery<'a> {
    pub name: &'static str,
    pub namespace: Option<&'a str>,
    pub collection: Option<&'static str>,
}

impl<'a> CacheQuery<'a> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            namespace: None,
            collection: None,
        }
    }

    pub fn namespace(mut self, namespace: &'a str) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn collection(mut self, collection: &'static str) -> Self {
        self.collection = Some(collection);
        self
    }
}

impl From<&'static str> for CacheQuery<'_> {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}

pub async fn log_cache_query<'a, F, T, E, R>(
    query: impl Into<CacheQuery<'a>>,
    future: F,
    row_counter: R,
) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
    R: Fn(&T) -> u64,
{
    let query = query.into();
    let span = info_span!(
        "cache_query",
        query = query.name,
        namespace = query.namespace.unwrap_or("-"),
        collection = query.collection.unwrap_or("-"),
    );
    let start = Instant::now();
    let result = future.instrument(span.clone()).await;
    let elapsed = start.elapsed();
    let latency_ms = elapsed.as_millis() as u64;

    span.in_scope(|| match &result {
        Ok(value) if elapsed >= SLOW_QUERY => {
            warn!(latency_ms, rows = row_counter(value), "Slow cache query");
        }
        Ok(value) => debug!(latency_ms, rows = row_counter(value), "Cache query executed"),
        Err(error) => warn!(latency_ms, error = ?error, "Cache query failed"),
    });

    result
}

#[macro_export]
macro_rules! cache_execute {
    ($query:expr, $future:expr) => {
        $crate::telemetry::database::log_cache_query($query, $future, |result| {
            result.rows_affected()
        })
        .await
    };
}

#[macro_export]
macro_rules! cache_fetch_all {
    ($query:expr, $future:expr) => {
        $crate::telemetry::database::log_cache_query($query, $future, |rows| rows.len() as u64)
            .await
    };
}

#[macro_export]
macro_rules! cache_fetch_optional {
    ($query:expr, $future:expr) => {
        $crate::telemetry::database::log_cache_query($query, $future, |row| {
            u64::from(row.is_some())
        })
        .await
    };
}
