use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::usage::UsageEstimate;

/// Hours treated as one month. Used for every hourly <-> monthly conversion.
pub const HOUR_TO_MONTH: Decimal = dec!(730);

/// A quantity or cost that is either explicitly known or left for the
/// reconciliation pass to derive from its sibling field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Amount {
    #[default]
    Unset,
    Explicit(Decimal),
}

impl Amount {
    pub fn value(&self) -> Option<Decimal> {
        match self {
            Amount::Unset => None,
            Amount::Explicit(d) => Some(*d),
        }
    }

    pub fn or(self, other: Amount) -> Amount {
        match self {
            Amount::Unset => other,
            set => set,
        }
    }
}

/// One billable dimension of a resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostComponent {
    pub name: String,
    pub unit: String,
    /// Key used to resolve `price` against a price source.
    pub price_key: Option<String>,
    pub ignore_if_missing_price: bool,
    pub hourly_quantity: Amount,
    pub monthly_quantity: Amount,
    pub bucket_quantity: Amount,
    price: Decimal,
    price_hash: String,
    pub hourly_cost: Amount,
    pub monthly_cost: Amount,
    pub bucket_cost: Amount,
}

impl CostComponent {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            ..Default::default()
        }
    }

    pub fn priced_by(mut self, key: impl Into<String>) -> Self {
        self.price_key = Some(key.into());
        self
    }

    pub fn hourly(mut self, quantity: Decimal) -> Self {
        self.hourly_quantity = Amount::Explicit(quantity);
        self
    }

    pub fn monthly(mut self, quantity: Decimal) -> Self {
        self.monthly_quantity = Amount::Explicit(quantity);
        self
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn set_price(&mut self, price: Decimal) {
        self.price = price;
    }

    pub fn price_hash(&self) -> &str {
        &self.price_hash
    }

    pub fn set_price_hash(&mut self, hash: impl Into<String>) {
        self.price_hash = hash.into();
    }

    /// Quantity shown for the reporting bucket. Components priced from a
    /// declaration rather than billing data report their monthly quantity.
    pub fn effective_bucket_quantity(&self) -> Option<Decimal> {
        self.bucket_quantity.or(self.monthly_quantity).value()
    }

    pub fn effective_bucket_cost(&self) -> Option<Decimal> {
        self.bucket_cost.or(self.monthly_cost).value()
    }
}

/// A node in the cost tree. Owns its components and sub-resources.
#[derive(Debug, Clone, Default)]
pub struct Resource {
    pub name: String,
    pub cost_components: Vec<CostComponent>,
    pub sub_resources: Vec<Resource>,
    pub is_skipped: bool,
    pub bucket_cost: Decimal,
    pub usage_estimate: Option<UsageEstimate>,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_skipped: true,
            ..Default::default()
        }
    }

    /// Visit every component in this resource and its sub-resources.
    pub fn for_each_component_mut(&mut self, f: &mut dyn FnMut(&str, &mut CostComponent)) {
        for c in &mut self.cost_components {
            f(&self.name, c);
        }
        for sub in &mut self.sub_resources {
            sub.for_each_component_mut(f);
        }
    }
}
