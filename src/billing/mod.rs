pub mod explorer;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{Datelike, Months, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Amount, CostComponent, Resource};

pub use explorer::{FileBillingSource, HttpBillingSource};

const UNBLENDED_COST: &str = "UnblendedCost";
const USAGE_QUANTITY: &str = "UsageQuantity";

#[derive(Debug, Error)]
#[error("invalid month {0:?}, expected YYYY-MM (e.g. 2020-10)")]
pub struct PeriodError(String);

/// One calendar month; `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    /// Label used in report headers, e.g. "Oct 2020".
    pub fn label(&self) -> String {
        self.start.format("%b %Y").to_string()
    }
}

impl FromStr for BillingPeriod {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PeriodError(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(err)?;
        let digits = |part: &str, len: usize| {
            part.len() == len && part.bytes().all(|b| b.is_ascii_digit())
        };
        if !digits(year, 4) || !digits(month, 2) {
            return Err(err());
        }
        let year: i32 = year.parse().map_err(|_| err())?;
        let month: u32 = month.parse().map_err(|_| err())?;
        let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(err)?;
        let end = start.checked_add_months(Months::new(1)).ok_or_else(err)?;
        Ok(Self { start, end })
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.start.year(), self.start.month())
    }
}

/// Tag constraint for a billing query. Only equality and AND are supported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TagExpression {
    #[serde(rename = "Tags")]
    Tag {
        #[serde(rename = "Key")]
        key: String,
        /// Empty means "any value of key".
        #[serde(rename = "Values")]
        values: Vec<String>,
    },
    And(Vec<TagExpression>),
}

/// Build a filter from `KEY=VALUE` terms. One term is used as-is; two or
/// more are ANDed. Blank terms are ignored.
pub fn build_filter<S: AsRef<str>>(terms: &[S]) -> Option<TagExpression> {
    let mut exprs: Vec<TagExpression> = terms
        .iter()
        .map(|t| t.as_ref().trim())
        .filter(|t| !t.is_empty())
        .map(|t| {
            let (key, values) = match t.split_once('=') {
                Some((k, v)) => (k, vec![v.to_string()]),
                None => (t, Vec::new()),
            };
            TagExpression::Tag {
                key: key.to_string(),
                values,
            }
        })
        .collect();

    match exprs.len() {
        0 => None,
        1 => exprs.pop(),
        _ => Some(TagExpression::And(exprs)),
    }
}

/// Split a comma-separated `--tags` argument into filter terms.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DateInterval {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupDefinition {
    #[serde(rename = "Type")]
    pub kind: String,
    pub key: String,
}

/// A grouped cost-and-usage query for one reporting period.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CostAndUsageQuery {
    pub time_period: DateInterval,
    pub granularity: String,
    pub metrics: Vec<String>,
    pub group_by: Vec<GroupDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<TagExpression>,
}

impl CostAndUsageQuery {
    pub fn monthly(period: &BillingPeriod, filter: Option<TagExpression>) -> Self {
        let dimension = |key: &str| GroupDefinition {
            kind: "DIMENSION".to_string(),
            key: key.to_string(),
        };
        Self {
            time_period: DateInterval {
                start: period.start.format("%Y-%m-%d").to_string(),
                end: period.end.format("%Y-%m-%d").to_string(),
            },
            granularity: "MONTHLY".to_string(),
            metrics: vec!["UNBLENDED_COST".to_string(), "USAGE_QUANTITY".to_string()],
            group_by: vec![dimension("SERVICE"), dimension("USAGE_TYPE")],
            filter,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricValue {
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub unit: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Group {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, MetricValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultByTime {
    #[serde(default)]
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CostAndUsageResponse {
    #[serde(default)]
    pub results_by_time: Vec<ResultByTime>,
}

/// Where grouped billing data comes from.
pub trait BillingSource {
    fn query_cost_and_usage(&self, query: &CostAndUsageQuery) -> Result<CostAndUsageResponse>;
}

/// Parse a billing amount. Unparseable strings count as zero; the caller
/// still sees a warning.
fn parse_amount(raw: &str, service: &str, usage_type: &str, field: &str) -> Decimal {
    match Decimal::from_str(raw.trim()).or_else(|_| Decimal::from_scientific(raw.trim())) {
        Ok(d) => d,
        Err(e) => {
            warn!(
                service,
                usage_type,
                field,
                value = raw,
                "unparseable billing amount, treating as zero: {e}"
            );
            Decimal::ZERO
        }
    }
}

/// Turn one period's grouped billing rows into per-service resources.
/// The result is in map order; callers must sort before rendering.
pub fn build_resources(response: &CostAndUsageResponse) -> Result<Vec<Resource>> {
    let Some(result) = response.results_by_time.first() else {
        bail!("billing response contained no results for the requested period");
    };

    let empty = MetricValue::default();
    let mut by_service: HashMap<String, Resource> = HashMap::new();

    for group in &result.groups {
        let service = group.keys.first().map(String::as_str).unwrap_or_default();
        let usage_type = group.keys.get(1).map(String::as_str).unwrap_or_default();

        let cost_metric = group.metrics.get(UNBLENDED_COST).unwrap_or(&empty);
        let cost = parse_amount(&cost_metric.amount, service, usage_type, UNBLENDED_COST);
        if cost.is_zero() {
            debug!(service, usage_type, "skipping zero-cost billing group");
            continue;
        }

        let usage_metric = group.metrics.get(USAGE_QUANTITY).unwrap_or(&empty);
        let quantity = parse_amount(&usage_metric.amount, service, usage_type, USAGE_QUANTITY);

        let resource = by_service
            .entry(service.to_string())
            .or_insert_with(|| Resource::new(service));

        let mut component = CostComponent::new(usage_type, usage_metric.unit.clone());
        component.bucket_quantity = Amount::Explicit(quantity);
        component.bucket_cost = Amount::Explicit(cost);
        // Billed lines carry their own cost; no price lookup applies.
        component.ignore_if_missing_price = true;
        resource.cost_components.push(component);
    }

    Ok(by_service.into_values().collect())
}

/// Query the source for one period and group the result.
pub fn load_resources(
    source: &dyn BillingSource,
    period: &BillingPeriod,
    filter: Option<TagExpression>,
) -> Result<Vec<Resource>> {
    let query = CostAndUsageQuery::monthly(period, filter);
    let response = source.query_cost_and_usage(&query)?;
    build_resources(&response)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::cost::sort_resources;

    fn group(service: &str, usage_type: &str, cost: &str, qty: &str, unit: &str) -> Group {
        let mut metrics = HashMap::new();
        metrics.insert(
            UNBLENDED_COST.to_string(),
            MetricValue {
                amount: cost.to_string(),
                unit: "USD".to_string(),
            },
        );
        metrics.insert(
            USAGE_QUANTITY.to_string(),
            MetricValue {
                amount: qty.to_string(),
                unit: unit.to_string(),
            },
        );
        Group {
            keys: vec![service.to_string(), usage_type.to_string()],
            metrics,
        }
    }

    fn response(groups: Vec<Group>) -> CostAndUsageResponse {
        CostAndUsageResponse {
            results_by_time: vec![ResultByTime { groups }],
        }
    }

    #[test]
    fn period_parses_month() {
        let p: BillingPeriod = "2020-10".parse().unwrap();
        assert_eq!(p.start, NaiveDate::from_ymd_opt(2020, 10, 1).unwrap());
        assert_eq!(p.end, NaiveDate::from_ymd_opt(2020, 11, 1).unwrap());
        assert_eq!(p.label(), "Oct 2020");
        assert_eq!(p.to_string(), "2020-10");
    }

    #[test]
    fn period_rolls_over_year() {
        let p: BillingPeriod = "2020-12".parse().unwrap();
        assert_eq!(p.end, NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
    }

    #[test]
    fn period_rejects_bad_formats() {
        for bad in [
            "2020-13", "2020/10", "20-10", "2020-1", "october", "", "+202-+1", "2020-+1", "-020-10",
        ] {
            assert!(bad.parse::<BillingPeriod>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn single_tag_is_plain_equality() {
        let filter = build_filter(&parse_tags("SVC=myapp"));
        assert_eq!(
            filter,
            Some(TagExpression::Tag {
                key: "SVC".to_string(),
                values: vec!["myapp".to_string()],
            })
        );
    }

    #[test]
    fn multiple_tags_are_anded() {
        let filter = build_filter(&parse_tags("SVC=myapp,STAGE=prod")).unwrap();
        let TagExpression::And(terms) = filter else {
            panic!("expected And, got {filter:?}");
        };
        assert_eq!(terms.len(), 2);
        assert_eq!(
            terms[1],
            TagExpression::Tag {
                key: "STAGE".to_string(),
                values: vec!["prod".to_string()],
            }
        );
    }

    #[test]
    fn tag_without_value_matches_any_value() {
        let filter = build_filter(&["SVC"]).unwrap();
        assert_eq!(
            filter,
            TagExpression::Tag {
                key: "SVC".to_string(),
                values: vec![],
            }
        );
    }

    #[test]
    fn empty_tags_mean_no_filter() {
        assert_eq!(build_filter(&parse_tags("")), None);
        assert_eq!(build_filter::<&str>(&[]), None);
    }

    #[test]
    fn query_serializes_in_provider_shape() {
        let period: BillingPeriod = "2020-10".parse().unwrap();
        let query = CostAndUsageQuery::monthly(&period, build_filter(&["SVC=myapp", "STAGE=prod"]));
        let json = serde_json::to_value(&query).unwrap();

        assert_eq!(json["TimePeriod"]["Start"], "2020-10-01");
        assert_eq!(json["TimePeriod"]["End"], "2020-11-01");
        assert_eq!(json["Granularity"], "MONTHLY");
        assert_eq!(json["GroupBy"][1]["Key"], "USAGE_TYPE");
        assert_eq!(json["GroupBy"][0]["Type"], "DIMENSION");
        assert_eq!(json["Filter"]["And"][0]["Tags"]["Key"], "SVC");
        assert_eq!(json["Filter"]["And"][1]["Tags"]["Values"][0], "prod");
    }

    #[test]
    fn query_omits_missing_filter() {
        let period: BillingPeriod = "2021-02".parse().unwrap();
        let json = serde_json::to_value(CostAndUsageQuery::monthly(&period, None)).unwrap();
        assert!(json.get("Filter").is_none());
    }

    #[test]
    fn groups_components_by_service() {
        let resp = response(vec![
            group("Amazon DynamoDB", "TimedStorage-ByteHrs", "1.25", "5", "GB-Mo"),
            group("AWS Lambda", "Request", "0.2", "1000000", "Requests"),
            group("Amazon DynamoDB", "ReadRequestUnits", "0.5", "2000000", "ReadRequestUnits"),
        ]);

        let mut resources = build_resources(&resp).unwrap();
        sort_resources(&mut resources);

        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].name, "AWS Lambda");
        let dynamo = &resources[1];
        assert_eq!(dynamo.name, "Amazon DynamoDB");
        let names: Vec<_> = dynamo.cost_components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["TimedStorage-ByteHrs", "ReadRequestUnits"]);

        let storage = &dynamo.cost_components[0];
        assert_eq!(storage.unit, "GB-Mo");
        assert_eq!(storage.bucket_quantity, Amount::Explicit(dec!(5)));
        assert_eq!(storage.bucket_cost, Amount::Explicit(dec!(1.25)));
    }

    #[test]
    fn zero_cost_groups_are_dropped() {
        let resp = response(vec![
            group("Amazon S3", "Requests-Tier1", "0", "12", "Requests"),
            group("AWS Lambda", "Request", "0.0000000", "3", "Requests"),
        ]);
        assert!(build_resources(&resp).unwrap().is_empty());
    }

    #[test]
    fn unparseable_amounts_count_as_zero() {
        let resp = response(vec![
            group("Amazon S3", "Requests-Tier1", "n/a", "12", "Requests"),
            group("AWS Lambda", "Request", "0.4", "lots", "Requests"),
        ]);
        let resources = build_resources(&resp).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(
            resources[0].cost_components[0].bucket_quantity,
            Amount::Explicit(Decimal::ZERO)
        );
    }

    #[test]
    fn empty_response_is_an_error() {
        assert!(build_resources(&CostAndUsageResponse::default()).is_err());
    }

    #[test]
    fn deserializes_saved_response() {
        let raw = r#"{
            "GroupDefinitions": [{"Type": "DIMENSION", "Key": "SERVICE"}],
            "ResultsByTime": [{
                "TimePeriod": {"Start": "2020-10-01", "End": "2020-11-01"},
                "Total": {},
                "Groups": [{
                    "Keys": ["Amazon Simple Storage Service", "TimedStorage-ByteHrs"],
                    "Metrics": {
                        "UnblendedCost": {"Amount": "0.0230000001", "Unit": "USD"},
                        "UsageQuantity": {"Amount": "1.0000000043", "Unit": "GB-Mo"}
                    }
                }],
                "Estimated": false
            }]
        }"#;
        let resp: CostAndUsageResponse = serde_json::from_str(raw).unwrap();
        let resources = build_resources(&resp).unwrap();
        assert_eq!(resources[0].name, "Amazon Simple Storage Service");
        assert_eq!(
            resources[0].cost_components[0].bucket_cost,
            Amount::Explicit(dec!(0.0230000001))
        );
    }
}
