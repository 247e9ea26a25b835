//! Usage estimation from historical metrics.
//!
//! Each supported resource declares the usage keys it needs for pricing. The
//! estimator turns every key into one or more fetches (monthly statistics, or
//! a table description for DynamoDB storage) and stores whatever comes back. A failed or empty fetch leaves the key unset;
//! it never fails the resource or the run.

pub mod cloudwatch;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::ThreadPool;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::{debug, warn};

pub use cloudwatch::HttpMetricsSource;

/// Usage key -> value. Absent keys mean "use the default for this dimension".
pub type UsageMap = BTreeMap<String, Decimal>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Sum,
    Average,
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Statistic::Sum => "Sum",
            Statistic::Average => "Average",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardUnit {
    Count,
    Bytes,
    Milliseconds,
}

impl fmt::Display for StandardUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StandardUnit::Count => "Count",
            StandardUnit::Bytes => "Bytes",
            StandardUnit::Milliseconds => "Milliseconds",
        })
    }
}

/// A single-statistic query over the trailing 30-day window.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRequest {
    pub region: String,
    pub namespace: String,
    pub metric: String,
    pub dimensions: Vec<(String, String)>,
    pub statistic: Statistic,
    pub unit: StandardUnit,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// What a fetch produced.
#[derive(Debug)]
pub enum Outcome<T> {
    Value(T),
    NoData,
    Failed(FetchError),
}

pub type MetricOutcome = Outcome<Decimal>;

pub trait MetricsSource: Send + Sync {
    fn monthly_statistic(&self, request: &StatsRequest) -> MetricOutcome;

    /// Current size of a DynamoDB table in bytes, as its description reports it.
    fn table_size_bytes(&self, region: &str, table: &str) -> Outcome<Decimal>;

    /// Id of the first metrics configuration on `bucket` that has no filter,
    /// i.e. one that covers the whole bucket.
    fn whole_bucket_filter(&self, region: &str, bucket: &str) -> Outcome<String>;
}

/// Resource types the estimator knows how to query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstimateKind {
    DynamoDbTable,
    LambdaFunction,
    /// `filter_id` names the bucket metrics configuration that covers the
    /// whole bucket; request metrics are only published per filter.
    S3Bucket { filter_id: Option<String> },
}

impl EstimateKind {
    fn service(&self) -> &'static str {
        match self {
            EstimateKind::DynamoDbTable => "DynamoDB",
            EstimateKind::LambdaFunction => "Lambda",
            EstimateKind::S3Bucket { .. } => "S3",
        }
    }
}

/// Identity of one resource for usage estimation: what it is and where it
/// lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEstimate {
    pub kind: EstimateKind,
    pub region: String,
    pub id: String,
}

/// How to finish the combined metric value for a key.
#[derive(Debug, Clone, Copy)]
enum Finish {
    /// Round half away from zero to whole units.
    Whole,
    /// Divide then round to two decimal places.
    Scaled(Decimal),
}

enum Fetch {
    /// Sum of the statistics that returned data.
    Statistics(Vec<StatsRequest>),
    TableSize,
}

struct KeyPlan {
    fetch: Fetch,
    finish: Finish,
}

const DYNAMO_NS: &str = "AWS/DynamoDB";
const LAMBDA_NS: &str = "AWS/Lambda";
const S3_NS: &str = "AWS/S3";

const S3_TIER_1_METRICS: &[&str] = &["PutRequests", "CopyRequests", "PostRequests", "ListRequests"];
const S3_TIER_2_METRICS: &[&str] = &["GetRequests", "SelectRequests"];
const S3_REQUEST_KEYS: &[&str] = &["monthly_tier_1_requests", "monthly_tier_2_requests"];

const BYTES_PER_GB: Decimal = dec!(1000000000);

impl UsageEstimate {
    fn request(
        &self,
        namespace: &str,
        metric: &str,
        dimensions: Vec<(&str, &str)>,
        statistic: Statistic,
        unit: StandardUnit,
    ) -> StatsRequest {
        StatsRequest {
            region: self.region.clone(),
            namespace: namespace.to_string(),
            metric: metric.to_string(),
            dimensions: dimensions
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            statistic,
            unit,
        }
    }

    fn single_statistic(
        &self,
        namespace: &str,
        metric: &str,
        dimensions: Vec<(&str, &str)>,
        statistic: Statistic,
        unit: StandardUnit,
        finish: Finish,
    ) -> KeyPlan {
        KeyPlan {
            fetch: Fetch::Statistics(vec![self.request(namespace, metric, dimensions, statistic, unit)]),
            finish,
        }
    }

    /// Fetches backing `key`, or `None` when the key has nothing to query.
    fn plan(&self, key: &str) -> Option<KeyPlan> {
        let id = self.id.as_str();
        match (&self.kind, key) {
            (EstimateKind::DynamoDbTable, "storage_gb") => Some(KeyPlan {
                fetch: Fetch::TableSize,
                finish: Finish::Scaled(BYTES_PER_GB),
            }),
            (EstimateKind::DynamoDbTable, "monthly_read_request_units") => Some(self.single_statistic(
                DYNAMO_NS,
                "ConsumedReadCapacityUnits",
                vec![("TableName", id)],
                Statistic::Sum,
                StandardUnit::Count,
                Finish::Whole,
            )),
            (EstimateKind::DynamoDbTable, "monthly_write_request_units") => Some(self.single_statistic(
                DYNAMO_NS,
                "ConsumedWriteCapacityUnits",
                vec![("TableName", id)],
                Statistic::Sum,
                StandardUnit::Count,
                Finish::Whole,
            )),
            (EstimateKind::LambdaFunction, "monthly_requests") => Some(self.single_statistic(
                LAMBDA_NS,
                "Invocations",
                vec![("FunctionName", id)],
                Statistic::Sum,
                StandardUnit::Count,
                Finish::Whole,
            )),
            (EstimateKind::LambdaFunction, "request_duration_ms") => Some(self.single_statistic(
                LAMBDA_NS,
                "Duration",
                vec![("FunctionName", id)],
                Statistic::Average,
                StandardUnit::Milliseconds,
                Finish::Scaled(Decimal::ONE),
            )),
            (EstimateKind::S3Bucket { .. }, "storage_gb") => Some(self.single_statistic(
                S3_NS,
                "BucketSizeBytes",
                vec![("BucketName", id), ("StorageType", "StandardStorage")],
                Statistic::Average,
                StandardUnit::Bytes,
                Finish::Scaled(BYTES_PER_GB),
            )),
            (EstimateKind::S3Bucket { filter_id }, "monthly_tier_1_requests") => {
                self.s3_requests_plan(filter_id.as_deref()?, S3_TIER_1_METRICS)
            }
            (EstimateKind::S3Bucket { filter_id }, "monthly_tier_2_requests") => {
                self.s3_requests_plan(filter_id.as_deref()?, S3_TIER_2_METRICS)
            }
            _ => None,
        }
    }

    fn s3_requests_plan(&self, filter_id: &str, metrics: &[&str]) -> Option<KeyPlan> {
        let requests = metrics
            .iter()
            .map(|m| {
                self.request(
                    S3_NS,
                    m,
                    vec![("BucketName", self.id.as_str()), ("FilterId", filter_id)],
                    Statistic::Sum,
                    StandardUnit::Count,
                )
            })
            .collect();
        Some(KeyPlan {
            fetch: Fetch::Statistics(requests),
            finish: Finish::Whole,
        })
    }

    /// Request metrics are only published per metrics configuration. When
    /// the declaration names none, look up the one covering the whole bucket.
    /// Returns `None` when nothing needs to change.
    fn with_bucket_filter(&self, keys: &[&str], source: &dyn MetricsSource) -> Option<UsageEstimate> {
        let EstimateKind::S3Bucket { filter_id: None } = &self.kind else {
            return None;
        };
        if !keys.iter().any(|k| S3_REQUEST_KEYS.contains(k)) {
            return None;
        }
        match source.whole_bucket_filter(&self.region, &self.id) {
            Outcome::Value(filter_id) => {
                debug!(id = %self.id, filter_id = %filter_id, "found whole-bucket metrics filter");
                Some(UsageEstimate {
                    kind: EstimateKind::S3Bucket {
                        filter_id: Some(filter_id),
                    },
                    ..self.clone()
                })
            }
            Outcome::NoData => {
                debug!(id = %self.id, "no whole-bucket metrics filter, request usage left unset");
                None
            }
            Outcome::Failed(err) => {
                self.warn_failed("requests", &err);
                None
            }
        }
    }

    fn warn_failed(&self, usage_type: &str, err: &FetchError) {
        warn!(
            "Error estimating {} {} usage for {}: {}",
            self.kind.service(),
            usage_type,
            self.id,
            err
        );
    }

    fn sum_statistics(
        &self,
        key: &str,
        requests: &[StatsRequest],
        source: &dyn MetricsSource,
    ) -> Option<Decimal> {
        let mut total: Option<Decimal> = None;
        for req in requests {
            let usage_type = if requests.len() > 1 {
                format!("{key} ({})", req.metric)
            } else {
                key.to_string()
            };
            match source.monthly_statistic(req) {
                Outcome::Value(v) => match total.unwrap_or(Decimal::ZERO).checked_add(v) {
                    Some(sum) => total = Some(sum),
                    None => {
                        warn!(
                            "Error estimating {} {} usage for {}: sum overflowed",
                            self.kind.service(),
                            usage_type,
                            self.id
                        );
                        return None;
                    }
                },
                Outcome::NoData => {
                    debug!(
                        service = self.kind.service(),
                        key,
                        id = %self.id,
                        metric = %req.metric,
                        "no datapoints"
                    );
                }
                Outcome::Failed(err) => self.warn_failed(&usage_type, &err),
            }
        }
        total
    }

    fn table_size(&self, key: &str, source: &dyn MetricsSource) -> Option<Decimal> {
        match source.table_size_bytes(&self.region, &self.id) {
            Outcome::Value(bytes) => Some(bytes),
            Outcome::NoData => {
                debug!(service = self.kind.service(), key, id = %self.id, "table size not reported");
                None
            }
            Outcome::Failed(err) => {
                self.warn_failed(key, &err);
                None
            }
        }
    }

    /// Fetch one key and round it; `None` if nothing returned data.
    fn estimate_key(&self, key: &str, source: &dyn MetricsSource) -> Option<Decimal> {
        let Some(plan) = self.plan(key) else {
            debug!(service = self.kind.service(), key, id = %self.id, "no usage estimator for key");
            return None;
        };

        let total = match &plan.fetch {
            Fetch::Statistics(requests) => self.sum_statistics(key, requests, source),
            Fetch::TableSize => self.table_size(key, source),
        };

        total.map(|v| match plan.finish {
            Finish::Whole => v.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero),
            Finish::Scaled(divisor) => {
                (v / divisor).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
            }
        })
    }
}

/// Populate `usage` with estimates for `keys`. Keys are fetched in parallel
/// and merged once all fetches finish. Never fails: a key whose fetch fails
/// or returns nothing is logged and left unset.
pub fn estimate_usage(
    estimate: &UsageEstimate,
    keys: &[&str],
    usage: &mut UsageMap,
    source: &dyn MetricsSource,
) {
    let resolved = estimate.with_bucket_filter(keys, source);
    let estimate = resolved.as_ref().unwrap_or(estimate);

    let results: Vec<(&str, Option<Decimal>)> = keys
        .par_iter()
        .map(|key| (*key, estimate.estimate_key(key, source)))
        .collect();

    for (key, value) in results {
        if let Some(v) = value {
            usage.insert(key.to_string(), v);
        }
    }
}

/// Runs estimates on a fixed-size worker pool so a large resource list does
/// not flood the metrics API.
pub struct Estimator<'a> {
    pool: ThreadPool,
    source: &'a dyn MetricsSource,
}

impl<'a> Estimator<'a> {
    pub fn new(workers: usize, source: &'a dyn MetricsSource) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("usage-{i}"))
            .build()
            .context("Failed to start usage estimation workers")?;
        Ok(Self { pool, source })
    }

    /// Estimate many resources at once. Each gets its own map; the output is
    /// index-aligned with `jobs`.
    pub fn estimate_all(&self, jobs: &[(UsageEstimate, Vec<&str>)]) -> Vec<UsageMap> {
        self.pool.install(|| {
            jobs.par_iter()
                .map(|(estimate, keys)| {
                    let mut usage = UsageMap::new();
                    estimate_usage(estimate, keys, &mut usage, self.source);
                    usage
                })
                .collect()
        })
    }
}
