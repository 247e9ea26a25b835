use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::types::Resource;

/// On-demand list prices (us-east-1) for the declared resource types.
const DEFAULT_PRICES: &[(&str, Decimal)] = &[
    ("aws_dynamodb_table.write_request_units", dec!(0.00000125)),
    ("aws_dynamodb_table.read_request_units", dec!(0.00000025)),
    ("aws_dynamodb_table.write_capacity_units", dec!(0.00065)),
    ("aws_dynamodb_table.read_capacity_units", dec!(0.00013)),
    ("aws_dynamodb_table.replicated_write_request_units", dec!(0.000001875)),
    ("aws_dynamodb_table.replicated_write_capacity_units", dec!(0.000975)),
    ("aws_dynamodb_table.storage_gb", dec!(0.25)),
    ("aws_lambda_function.requests", dec!(0.2)),
    ("aws_lambda_function.duration", dec!(0.0000166667)),
    ("aws_s3_bucket.standard_storage_gb", dec!(0.023)),
    ("aws_s3_bucket.tier_1_requests", dec!(0.005)),
    ("aws_s3_bucket.tier_2_requests", dec!(0.0004)),
];

#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub price: Decimal,
    pub price_hash: String,
}

/// Trait for looking up a unit price by price key.
pub trait PriceSource {
    fn lookup(&self, key: &str) -> Option<PriceQuote>;
}

pub struct PriceTable {
    map: HashMap<String, Decimal>,
}

fn price_hash(key: &str, price: &Decimal) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    price.normalize().to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl PriceSource for PriceTable {
    fn lookup(&self, key: &str) -> Option<PriceQuote> {
        self.map.get(key).map(|price| PriceQuote {
            price: *price,
            price_hash: price_hash(key, price),
        })
    }
}

impl PriceTable {
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        for (k, v) in DEFAULT_PRICES {
            table.map.insert(k.to_string(), *v);
        }
        table
    }

    /// Later overrides replace earlier entries.
    pub fn extend(&mut self, overrides: &HashMap<String, Decimal>) {
        for (k, v) in overrides {
            self.map.insert(k.clone(), *v);
        }
    }

    /// Read a JSON object of price key -> price (string or number).
    pub fn extend_from_file(&mut self, path: &Path) -> Result<()> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let overrides: HashMap<String, Decimal> = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse price file {}", path.display()))?;
        self.extend(&overrides);
        Ok(())
    }
}

/// Resolve prices for every component in the tree. Unresolved prices become
/// zero. Returns "resource / component" labels of components that needed a
/// price and had none; with `strict` those abort instead.
pub fn apply_prices(
    resources: &mut [Resource],
    source: &dyn PriceSource,
    strict: bool,
) -> Result<Vec<String>> {
    let mut unpriced = Vec::new();

    for r in resources.iter_mut().filter(|r| !r.is_skipped) {
        r.for_each_component_mut(&mut |owner, c| {
            let quote = c.price_key.as_deref().and_then(|k| source.lookup(k));
            match quote {
                Some(q) => {
                    c.set_price(q.price);
                    c.set_price_hash(q.price_hash);
                    debug!(
                        resource = owner,
                        component = %c.name,
                        price = %c.price(),
                        price_hash = c.price_hash(),
                        "resolved price"
                    );
                }
                None => {
                    c.set_price(Decimal::ZERO);
                    if c.ignore_if_missing_price {
                        debug!(resource = owner, component = %c.name, "no price, ignored");
                    } else {
                        unpriced.push(format!("{owner} / {}", c.name));
                    }
                }
            }
        });
    }

    unpriced.sort();
    if !unpriced.is_empty() {
        if strict {
            bail!("No pricing data for: {}", unpriced.join(", "));
        }
        warn!("No pricing data for: {}", unpriced.join(", "));
    }
    Ok(unpriced)
}
