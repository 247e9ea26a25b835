use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::warn;

use crate::types::{CostComponent, Resource};
use crate::usage::{EstimateKind, UsageEstimate, UsageMap};

const DEFAULT_LAMBDA_MEMORY_MB: i64 = 128;

/// One declared resource, as written in a resources file:
///
/// ```toml
/// [[resource]]
/// address = "aws_dynamodb_table.orders"
/// type = "aws_dynamodb_table"
/// region = "us-east-1"
/// id = "orders"
/// billing_mode = "PAY_PER_REQUEST"
/// usage = { storage_gb = 20 }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSpec {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub region: String,
    /// Remote identifier (table name, function name, bucket name).
    pub id: Option<String>,
    pub billing_mode: Option<String>,
    pub read_capacity: Option<i64>,
    pub write_capacity: Option<i64>,
    #[serde(default)]
    pub replica_regions: Vec<String>,
    pub memory_size: Option<i64>,
    pub metrics_filter: Option<String>,
    /// Explicit usage values; these win over estimates.
    #[serde(default)]
    pub usage: UsageMap,
}

#[derive(Debug, Deserialize)]
struct ResourcesFile {
    #[serde(default)]
    resource: Vec<ResourceSpec>,
}

pub fn load_specs(path: &Path) -> Result<Vec<ResourceSpec>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_specs(&data).with_context(|| format!("Invalid resources file {}", path.display()))
}

pub fn parse_specs(data: &str) -> Result<Vec<ResourceSpec>> {
    let file: ResourcesFile = toml::from_str(data)?;
    Ok(file.resource)
}

fn pay_per_request(spec: &ResourceSpec) -> bool {
    spec.billing_mode.as_deref() == Some("PAY_PER_REQUEST")
}

impl ResourceSpec {
    fn remote_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.address)
    }

    /// Usage keys this resource needs for accurate pricing.
    pub fn usage_keys(&self) -> Vec<&'static str> {
        match self.kind.as_str() {
            "aws_dynamodb_table" if pay_per_request(self) => vec![
                "storage_gb",
                "monthly_read_request_units",
                "monthly_write_request_units",
            ],
            "aws_dynamodb_table" => vec!["storage_gb"],
            "aws_lambda_function" => vec!["monthly_requests", "request_duration_ms"],
            "aws_s3_bucket" => vec![
                "storage_gb",
                "monthly_tier_1_requests",
                "monthly_tier_2_requests",
            ],
            _ => Vec::new(),
        }
    }

    /// Identity handed to the usage estimator, if this type supports it.
    pub fn usage_estimate(&self) -> Option<UsageEstimate> {
        let kind = match self.kind.as_str() {
            "aws_dynamodb_table" => EstimateKind::DynamoDbTable,
            "aws_lambda_function" => EstimateKind::LambdaFunction,
            "aws_s3_bucket" => EstimateKind::S3Bucket {
                filter_id: self.metrics_filter.clone(),
            },
            _ => return None,
        };
        Some(UsageEstimate {
            kind,
            region: self.region.clone(),
            id: self.remote_id().to_string(),
        })
    }

    /// Build the resource from estimated usage overlaid with explicit usage.
    /// Fails when the usage values overflow the derived quantities.
    pub fn build(&self, estimated: &UsageMap) -> Result<Resource> {
        let mut usage = estimated.clone();
        usage.extend(self.usage.iter().map(|(k, v)| (k.clone(), *v)));

        let mut resource = match self.kind.as_str() {
            "aws_dynamodb_table" => dynamodb_table(self, &usage),
            "aws_lambda_function" => lambda_function(self, &usage)
                .with_context(|| format!("Invalid usage for {}", self.address))?,
            "aws_s3_bucket" => s3_bucket(self, &usage),
            other => {
                warn!(address = %self.address, "unsupported resource type {other}, skipping");
                return Ok(Resource::skipped(&self.address));
            }
        };
        resource.usage_estimate = self.usage_estimate();
        Ok(resource)
    }
}

fn usage_value(usage: &UsageMap, key: &str) -> Decimal {
    usage.get(key).copied().unwrap_or(Decimal::ZERO)
}

fn dynamodb_table(spec: &ResourceSpec, usage: &UsageMap) -> Resource {
    let mut r = Resource::new(&spec.address);

    if pay_per_request(spec) {
        r.cost_components.push(
            CostComponent::new("Write request unit (WRU)", "WRUs")
                .priced_by("aws_dynamodb_table.write_request_units")
                .monthly(usage_value(usage, "monthly_write_request_units")),
        );
        r.cost_components.push(
            CostComponent::new("Read request unit (RRU)", "RRUs")
                .priced_by("aws_dynamodb_table.read_request_units")
                .monthly(usage_value(usage, "monthly_read_request_units")),
        );
    } else {
        r.cost_components.push(
            CostComponent::new("Write capacity unit (WCU)", "WCU")
                .priced_by("aws_dynamodb_table.write_capacity_units")
                .hourly(Decimal::from(spec.write_capacity.unwrap_or(0))),
        );
        r.cost_components.push(
            CostComponent::new("Read capacity unit (RCU)", "RCU")
                .priced_by("aws_dynamodb_table.read_capacity_units")
                .hourly(Decimal::from(spec.read_capacity.unwrap_or(0))),
        );
    }

    r.cost_components.push(
        CostComponent::new("Data storage", "GB")
            .priced_by("aws_dynamodb_table.storage_gb")
            .monthly(usage_value(usage, "storage_gb")),
    );

    for region in &spec.replica_regions {
        let mut replica = Resource::new(format!("Global table ({region})"));
        let component = if pay_per_request(spec) {
            CostComponent::new("Replicated write request unit (rWRU)", "rWRU")
                .priced_by("aws_dynamodb_table.replicated_write_request_units")
                .monthly(usage_value(usage, "monthly_write_request_units"))
        } else {
            CostComponent::new("Replicated write capacity unit (rWCU)", "rWCU")
                .priced_by("aws_dynamodb_table.replicated_write_capacity_units")
                .hourly(Decimal::from(spec.write_capacity.unwrap_or(0)))
        };
        replica.cost_components.push(component);
        r.sub_resources.push(replica);
    }

    r
}

fn lambda_function(spec: &ResourceSpec, usage: &UsageMap) -> Result<Resource> {
    let memory_mb = Decimal::from(spec.memory_size.unwrap_or(DEFAULT_LAMBDA_MEMORY_MB));
    let requests = usage_value(usage, "monthly_requests");
    let duration_ms = usage_value(usage, "request_duration_ms");
    let gb_seconds = requests
        .checked_mul(duration_ms / dec!(1000))
        .and_then(|s| s.checked_mul(memory_mb / dec!(1024)))
        .context("GB-seconds overflowed; check monthly_requests and request_duration_ms")?;

    let mut r = Resource::new(&spec.address);
    r.cost_components.push(
        CostComponent::new("Requests", "1M requests")
            .priced_by("aws_lambda_function.requests")
            .monthly(requests / dec!(1000000)),
    );
    r.cost_components.push(
        CostComponent::new("Duration", "GB-seconds")
            .priced_by("aws_lambda_function.duration")
            .monthly(gb_seconds),
    );
    Ok(r)
}

fn s3_bucket(spec: &ResourceSpec, usage: &UsageMap) -> Resource {
    let mut r = Resource::new(&spec.address);
    r.cost_components.push(
        CostComponent::new("Standard storage", "GB")
            .priced_by("aws_s3_bucket.standard_storage_gb")
            .monthly(usage_value(usage, "storage_gb")),
    );
    r.cost_components.push(
        CostComponent::new("PUT, COPY, POST, LIST requests", "1k requests")
            .priced_by("aws_s3_bucket.tier_1_requests")
            .monthly(usage_value(usage, "monthly_tier_1_requests") / dec!(1000)),
    );
    r.cost_components.push(
        CostComponent::new("GET, SELECT, and all other requests", "1k requests")
            .priced_by("aws_s3_bucket.tier_2_requests")
            .monthly(usage_value(usage, "monthly_tier_2_requests") / dec!(1000)),
    );
    r
}

/// Usage values for the keys a spec declares, for logging.
pub fn declared_usage(spec: &ResourceSpec, usage: &UsageMap) -> BTreeMap<String, Decimal> {
    spec.usage_keys()
        .into_iter()
        .filter_map(|k| usage.get(k).map(|v| (k.to_string(), *v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Amount;
    use crate::usage::estimate_usage;
    use crate::usage::tests::StubMetrics;

    const FILE: &str = r#"
[[resource]]
address = "aws_dynamodb_table.orders"
type = "aws_dynamodb_table"
region = "us-east-2"
billing_mode = "PAY_PER_REQUEST"
replica_regions = ["us-west-2"]
usage = { storage_gb = 20 }

[[resource]]
address = "aws_dynamodb_table.legacy"
type = "aws_dynamodb_table"
region = "us-east-1"
id = "legacy-table"
billing_mode = "PROVISIONED"
read_capacity = 30
write_capacity = 20

[[resource]]
address = "aws_lambda_function.resize"
type = "aws_lambda_function"
region = "eu-west-1"
id = "resize"
memory_size = 512

[[resource]]
address = "aws_instance.web"
type = "aws_instance"
region = "us-east-1"
"#;

    fn specs() -> Vec<ResourceSpec> {
        parse_specs(FILE).unwrap()
    }

    #[test]
    fn parses_resources_file() {
        let specs = specs();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[0].usage.get("storage_gb"), Some(&dec!(20)));
        assert_eq!(specs[1].read_capacity, Some(30));
        assert_eq!(specs[2].memory_size, Some(512));
    }

    #[test]
    fn usage_keys_follow_billing_mode() {
        let specs = specs();
        assert!(specs[0].usage_keys().contains(&"monthly_read_request_units"));
        assert_eq!(specs[1].usage_keys(), vec!["storage_gb"]);
        assert!(specs[3].usage_keys().is_empty());
    }

    #[test]
    fn estimate_identity_uses_id_or_address() {
        let specs = specs();
        assert_eq!(specs[0].usage_estimate().unwrap().id, "aws_dynamodb_table.orders");
        let legacy = specs[1].usage_estimate().unwrap();
        assert_eq!(legacy.id, "legacy-table");
        assert_eq!(legacy.region, "us-east-1");
        assert!(specs[3].usage_estimate().is_none());
    }

    #[test]
    fn pay_per_request_table_from_estimated_usage() {
        let specs = specs();
        let spec = &specs[0];
        let source = StubMetrics::default()
            .with("ConsumedReadCapacityUnits", dec!(122.6))
            .with("ConsumedWriteCapacityUnits", dec!(455.9));
        let mut usage = UsageMap::new();
        let estimate = spec.usage_estimate().unwrap();
        estimate_usage(&estimate, &spec.usage_keys(), &mut usage, &source);

        let r = spec.build(&usage).unwrap();
        assert_eq!(r.cost_components[0].monthly_quantity, Amount::Explicit(dec!(456)));
        assert_eq!(r.cost_components[1].monthly_quantity, Amount::Explicit(dec!(123)));
        assert_eq!(r.cost_components[2].monthly_quantity, Amount::Explicit(dec!(20)));
        assert_eq!(r.sub_resources.len(), 1);
        assert_eq!(r.sub_resources[0].name, "Global table (us-west-2)");
        assert_eq!(r.usage_estimate, Some(estimate));
    }

    #[test]
    fn provisioned_table_uses_hourly_capacity() {
        let r = specs()[1].build(&UsageMap::new()).unwrap();
        assert_eq!(r.cost_components[0].name, "Write capacity unit (WCU)");
        assert_eq!(r.cost_components[0].hourly_quantity, Amount::Explicit(dec!(20)));
        assert_eq!(r.cost_components[0].monthly_quantity, Amount::Unset);
        assert_eq!(r.cost_components[1].hourly_quantity, Amount::Explicit(dec!(30)));
    }

    #[test]
    fn explicit_usage_wins_over_estimate() {
        let specs = specs();
        let spec = &specs[0];
        let mut estimated = UsageMap::new();
        estimated.insert("storage_gb".to_string(), dec!(1));
        let r = spec.build(&estimated).unwrap();
        assert_eq!(r.cost_components[2].monthly_quantity, Amount::Explicit(dec!(20)));
    }

    #[test]
    fn lambda_duration_in_gb_seconds() {
        let mut usage = UsageMap::new();
        usage.insert("monthly_requests".to_string(), dec!(2000000));
        usage.insert("request_duration_ms".to_string(), dec!(250));
        let r = specs()[2].build(&usage).unwrap();

        assert_eq!(r.cost_components[0].monthly_quantity, Amount::Explicit(dec!(2)));
        // 2M * 0.25s * 0.5GB
        assert_eq!(r.cost_components[1].monthly_quantity, Amount::Explicit(dec!(250000)));
    }

    #[test]
    fn oversized_lambda_usage_is_an_error() {
        let specs = parse_specs(
            r#"
[[resource]]
address = "aws_lambda_function.hot"
type = "aws_lambda_function"
region = "us-east-1"
usage = { monthly_requests = "100000000000000000000", request_duration_ms = "1000000000000" }
"#,
        )
        .unwrap();

        let err = specs[0].build(&UsageMap::new()).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("aws_lambda_function.hot"));
        assert!(msg.contains("GB-seconds overflowed"));
    }

    #[test]
    fn unsupported_type_is_skipped() {
        let r = specs()[3].build(&UsageMap::new()).unwrap();
        assert!(r.is_skipped);
        assert_eq!(r.name, "aws_instance.web");
        assert!(r.cost_components.is_empty());
    }

    #[test]
    fn declared_usage_filters_unknown_keys() {
        let specs = specs();
        let spec = &specs[2];
        let mut usage = UsageMap::new();
        usage.insert("monthly_requests".to_string(), dec!(5));
        usage.insert("bogus".to_string(), dec!(1));
        let shown = declared_usage(spec, &usage);
        assert_eq!(shown.len(), 1);
    }
}
