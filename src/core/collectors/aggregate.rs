//! Fan-in polling for collectors that match several processes or containers.

use std::collections::BTreeMap;

use tracing::trace;

use super::{error::CollectorError, types::CollectorResult};
use crate::core::model::{CollectionResult, MetricValue};

/// Key holding the number of matched sources in an aggregated result.
pub const COUNT_KEY: &str = "count";

/// A collector whose configured match may resolve to several live sources.
#[async_trait::async_trait]
pub trait MultiSourceCollector: Send + Sync {
    type Source: Send + Sync;

    /// Human description of the match rule, for errors.
    fn describe(&self) -> String;

    /// Every source currently matching the rule, in a stable order.
    async fn discover_sources(&mut self) -> CollectorResult<Vec<Self::Source>>;

    async fn poll_one(&mut self, source: &Self::Source) -> CollectorResult<CollectionResult>;
}

/// Polls the first matching source, or every matching source when `aggregate`
/// is set.
///
/// No match is `SourceNotFound`. An aggregated result sums every numeric
/// metric over the available sources, adds [`COUNT_KEY`] and takes the state
/// `aggregate_state`. When no matched source is available, the first
/// unavailable result is returned as is.
pub async fn poll_sources<C>(
    collector: &mut C,
    aggregate: bool,
    aggregate_state: &str,
) -> CollectorResult<CollectionResult>
where
    C: MultiSourceCollector + ?Sized,
{
    let sources = collector.discover_sources().await?;
    let Some(first) = sources.first() else {
        return Err(CollectorError::SourceNotFound(collector.describe()));
    };

    if !aggregate {
        return collector.poll_one(first).await;
    }

    let mut results = Vec::with_capacity(sources.len());
    let mut first_error = None;
    for source in &sources {
        match collector.poll_one(source).await {
            Ok(result) => results.push(result),
            // A source may vanish between discovery and poll.
            Err(e) => {
                trace!("Skipping source of {}: {}", collector.describe(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    if results.is_empty() {
        return Err(first_error
            .unwrap_or_else(|| CollectorError::SourceNotFound(collector.describe())));
    }

    Ok(sum_results(results, aggregate_state))
}

/// Sums numeric metrics of the available results.
pub fn sum_results(results: Vec<CollectionResult>, state: &str) -> CollectionResult {
    let available: Vec<&CollectionResult> = results.iter().filter(|r| r.available).collect();
    if available.is_empty() {
        return results
            .into_iter()
            .next()
            .unwrap_or_else(|| CollectionResult::not_found("no sources"));
    }

    let mut totals: BTreeMap<String, MetricValue> = BTreeMap::new();
    for result in &available {
        for (key, value) in result.data() {
            let summed = match (totals.get(key), value) {
                (None, v) if v.is_numeric() => v.clone(),
                (Some(MetricValue::Int(a)), MetricValue::Int(b)) => {
                    MetricValue::Int(a.saturating_add(*b))
                }
                (Some(a), b) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => MetricValue::Float(a + b),
                    _ => continue,
                },
                _ => continue,
            };
            totals.insert(key.clone(), summed);
        }
    }

    let mut result = CollectionResult::available(state);
    for (key, value) in totals {
        result.set(key, value);
    }
    result.set(COUNT_KEY, available.len());
    result
}
