use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ureq::Agent;

use super::{FetchError, MetricOutcome, MetricsSource, Outcome, Statistic, StatsRequest};

/// Length of the trailing window and of its single aggregation period.
const WINDOW_DAYS: i64 = 30;

const GET_METRIC_STATISTICS: &str = "GraniteServiceVersion20100801.GetMetricStatistics";
const DESCRIBE_TABLE: &str = "DynamoDB_20120810.DescribeTable";
const LIST_BUCKET_METRICS: &str = "S3.ListBucketMetricsConfigurations";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Dimension<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetMetricStatisticsInput<'a> {
    region: &'a str,
    namespace: &'a str,
    metric_name: &'a str,
    dimensions: Vec<Dimension<'a>>,
    start_time: String,
    end_time: String,
    period: i64,
    statistics: Vec<String>,
    unit: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Datapoint {
    sum: Option<Decimal>,
    average: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetMetricStatisticsOutput {
    #[serde(default)]
    datapoints: Vec<Datapoint>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTableInput<'a> {
    region: &'a str,
    table_name: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TableDescription {
    table_size_bytes: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTableOutput {
    table: Option<TableDescription>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketMetricsInput<'a> {
    region: &'a str,
    bucket: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetricsConfiguration {
    id: String,
    /// Absent or null when the configuration covers the whole bucket.
    #[serde(default)]
    filter: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketMetricsOutput {
    #[serde(default)]
    metrics_configuration_list: Vec<MetricsConfiguration>,
}

fn build_input<'a>(request: &'a StatsRequest, now: DateTime<Utc>) -> GetMetricStatisticsInput<'a> {
    let window = chrono::Duration::days(WINDOW_DAYS);
    GetMetricStatisticsInput {
        region: &request.region,
        namespace: &request.namespace,
        metric_name: &request.metric,
        dimensions: request
            .dimensions
            .iter()
            .map(|(name, value)| Dimension { name, value })
            .collect(),
        start_time: (now - window).to_rfc3339(),
        end_time: now.to_rfc3339(),
        period: window.num_seconds(),
        statistics: vec![request.statistic.to_string()],
        unit: request.unit.to_string(),
    }
}

fn read_outcome(body: &str, statistic: Statistic) -> MetricOutcome {
    let output: GetMetricStatisticsOutput = match serde_json::from_str(body) {
        Ok(o) => o,
        Err(e) => return MetricOutcome::Failed(FetchError::Malformed(e.to_string())),
    };
    let value = output.datapoints.first().and_then(|p| match statistic {
        Statistic::Sum => p.sum,
        Statistic::Average => p.average,
    });
    match value {
        Some(v) => MetricOutcome::Value(v),
        None => MetricOutcome::NoData,
    }
}

fn read_table_size(body: &str) -> Outcome<Decimal> {
    match serde_json::from_str::<DescribeTableOutput>(body) {
        Ok(output) => match output.table.and_then(|t| t.table_size_bytes) {
            Some(bytes) => Outcome::Value(bytes),
            None => Outcome::NoData,
        },
        Err(e) => Outcome::Failed(FetchError::Malformed(e.to_string())),
    }
}

fn read_whole_bucket_filter(body: &str) -> Outcome<String> {
    match serde_json::from_str::<ListBucketMetricsOutput>(body) {
        Ok(output) => match output
            .metrics_configuration_list
            .into_iter()
            .find(|c| c.filter.is_none())
        {
            Some(config) => Outcome::Value(config.id),
            None => Outcome::NoData,
        },
        Err(e) => Outcome::Failed(FetchError::Malformed(e.to_string())),
    }
}

/// JSON gateway for the monitoring, table and bucket APIs. Each call is a
/// POST whose `X-Amz-Target` header names the operation. Every call carries
/// its own timeout.
pub struct HttpMetricsSource {
    agent: Agent,
    endpoint: String,
    timeout: Duration,
}

impl HttpMetricsSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: Agent::new_with_config(config),
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

impl HttpMetricsSource {
    fn call(&self, target: &str, input: &impl Serialize) -> Result<String, FetchError> {
        let payload =
            serde_json::to_string(input).map_err(|e| FetchError::Malformed(e.to_string()))?;

        let response = self
            .agent
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("X-Amz-Target", target)
            .send(payload.as_str());

        let body = match response {
            Ok(mut resp) => resp.body_mut().read_to_string(),
            Err(e) => Err(e),
        };

        body.map_err(|e| match e {
            ureq::Error::Timeout(_) => FetchError::Timeout(self.timeout),
            e => FetchError::Transport(e.to_string()),
        })
    }
}

impl MetricsSource for HttpMetricsSource {
    fn monthly_statistic(&self, request: &StatsRequest) -> MetricOutcome {
        let input = build_input(request, Utc::now());
        match self.call(GET_METRIC_STATISTICS, &input) {
            Ok(body) => read_outcome(&body, request.statistic),
            Err(e) => Outcome::Failed(e),
        }
    }

    fn table_size_bytes(&self, region: &str, table: &str) -> Outcome<Decimal> {
        let input = DescribeTableInput {
            region,
            table_name: table,
        };
        match self.call(DESCRIBE_TABLE, &input) {
            Ok(body) => read_table_size(&body),
            Err(e) => Outcome::Failed(e),
        }
    }

    fn whole_bucket_filter(&self, region: &str, bucket: &str) -> Outcome<String> {
        let input = ListBucketMetricsInput { region, bucket };
        match self.call(LIST_BUCKET_METRICS, &input) {
            Ok(body) => read_whole_bucket_filter(&body),
            Err(e) => Outcome::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::usage::StandardUnit;

    fn request() -> StatsRequest {
        StatsRequest {
            region: "us-east-2".to_string(),
            namespace: "AWS/DynamoDB".to_string(),
            metric: "ConsumedReadCapacityUnits".to_string(),
            dimensions: vec![("TableName".to_string(), "orders".to_string())],
            statistic: Statistic::Sum,
            unit: StandardUnit::Count,
        }
    }

    #[test]
    fn input_covers_trailing_thirty_days() {
        let req = request();
        let now = Utc.with_ymd_and_hms(2020, 11, 1, 0, 0, 0).unwrap();
        let json = serde_json::to_value(build_input(&req, now)).unwrap();

        assert_eq!(json["MetricName"], "ConsumedReadCapacityUnits");
        assert_eq!(json["Namespace"], "AWS/DynamoDB");
        assert_eq!(json["Statistics"][0], "Sum");
        assert_eq!(json["Unit"], "Count");
        assert_eq!(json["Period"], 2_592_000);
        assert_eq!(json["Dimensions"][0]["Name"], "TableName");
        assert_eq!(json["Dimensions"][0]["Value"], "orders");
        assert_eq!(json["StartTime"], "2020-10-02T00:00:00+00:00");
    }

    #[test]
    fn reads_requested_statistic() {
        let body = r#"{"Label":"ConsumedReadCapacityUnits",
            "Datapoints":[{"Timestamp":"1970-01-01T00:00:00Z","Sum":122.6,"Average":3.1,"Unit":"Count"}]}"#;

        match read_outcome(body, Statistic::Sum) {
            MetricOutcome::Value(v) => assert_eq!(v, dec!(122.6)),
            other => panic!("expected value, got {other:?}"),
        }
        match read_outcome(body, Statistic::Average) {
            MetricOutcome::Value(v) => assert_eq!(v, dec!(3.1)),
            other => panic!("expected value, got {other:?}"),
        }
    }

    #[test]
    fn empty_datapoints_is_no_data() {
        let body = r#"{"Label":"Invocations","Datapoints":[]}"#;
        assert!(matches!(read_outcome(body, Statistic::Sum), MetricOutcome::NoData));

        let missing_stat = r#"{"Datapoints":[{"Average":1.0}]}"#;
        assert!(matches!(read_outcome(missing_stat, Statistic::Sum), MetricOutcome::NoData));
    }

    #[test]
    fn garbage_body_is_a_failure() {
        assert!(matches!(
            read_outcome("<html>", Statistic::Sum),
            MetricOutcome::Failed(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn reads_table_size() {
        let body = r#"{"Table":{"TableName":"orders","TableSizeBytes":10000000000,"ItemCount":12}}"#;
        match read_table_size(body) {
            Outcome::Value(v) => assert_eq!(v, dec!(10000000000)),
            other => panic!("expected value, got {other:?}"),
        }
        assert!(matches!(read_table_size(r#"{"Table":{}}"#), Outcome::NoData));
        assert!(matches!(read_table_size("nope"), Outcome::Failed(FetchError::Malformed(_))));
    }

    #[test]
    fn picks_first_unfiltered_metrics_configuration() {
        let body = r#"{"MetricsConfigurationList":[
            {"Id":"Documents","Filter":{"Prefix":"documents/"}},
            {"Id":"EntireBucket"},
            {"Id":"Later","Filter":null}
        ]}"#;
        match read_whole_bucket_filter(body) {
            Outcome::Value(id) => assert_eq!(id, "EntireBucket"),
            other => panic!("expected value, got {other:?}"),
        }

        let filtered_only = r#"{"MetricsConfigurationList":[{"Id":"Docs","Filter":{"Prefix":"d/"}}]}"#;
        assert!(matches!(read_whole_bucket_filter(filtered_only), Outcome::NoData));
        assert!(matches!(read_whole_bucket_filter("{}"), Outcome::NoData));
    }

    #[test]
    fn unreachable_endpoint_degrades_to_failure() {
        let source = HttpMetricsSource::new("http://127.0.0.1:9/metrics", Duration::from_millis(200));
        assert!(matches!(
            source.monthly_statistic(&request()),
            MetricOutcome::Failed(_)
        ));
        assert!(matches!(
            source.table_size_bytes("us-east-1", "orders"),
            Outcome::Failed(_)
        ));
        assert!(matches!(
            source.whole_bucket_filter("us-east-1", "assets"),
            Outcome::Failed(_)
        ));
    }
}
