use anyhow::{Context, Result};
use rust_decimal::Decimal;

use crate::types::{Amount, CostComponent, Resource, HOUR_TO_MONTH};

fn mul(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_mul(b)
        .with_context(|| format!("Decimal overflow computing {a} x {b}"))
}

fn add(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_add(b)
        .with_context(|| format!("Decimal overflow computing {a} + {b}"))
}

impl CostComponent {
    /// Derive whichever quantity and cost fields are unset. Safe to call
    /// repeatedly: once every field is set, nothing changes. Fields are only
    /// written once every product has been computed.
    pub fn calculate_costs(&mut self) -> Result<()> {
        let (hourly_qty, monthly_qty) = self.fill_quantities()?;

        let (hourly_cost, monthly_cost) = match (self.hourly_cost, self.monthly_cost) {
            (Amount::Unset, Amount::Unset) => {
                (mul(self.price(), hourly_qty)?, mul(self.price(), monthly_qty)?)
            }
            (Amount::Unset, Amount::Explicit(monthly)) => (monthly / HOUR_TO_MONTH, monthly),
            (Amount::Explicit(hourly), Amount::Unset) => (hourly, mul(hourly, HOUR_TO_MONTH)?),
            (Amount::Explicit(hourly), Amount::Explicit(monthly)) => (hourly, monthly),
        };
        self.hourly_cost = Amount::Explicit(hourly_cost);
        self.monthly_cost = Amount::Explicit(monthly_cost);
        Ok(())
    }

    /// Returns the (hourly, monthly) pair, both now set.
    fn fill_quantities(&mut self) -> Result<(Decimal, Decimal)> {
        let (hourly, monthly) = match (self.hourly_quantity, self.monthly_quantity) {
            (Amount::Unset, Amount::Unset) => (Decimal::ZERO, Decimal::ZERO),
            (Amount::Unset, Amount::Explicit(monthly)) => (monthly / HOUR_TO_MONTH, monthly),
            (Amount::Explicit(hourly), Amount::Unset) => (hourly, mul(hourly, HOUR_TO_MONTH)?),
            (Amount::Explicit(hourly), Amount::Explicit(monthly)) => (hourly, monthly),
        };
        self.hourly_quantity = Amount::Explicit(hourly);
        self.monthly_quantity = Amount::Explicit(monthly);
        Ok((hourly, monthly))
    }
}

impl Resource {
    /// Reconcile every component in the tree, then roll bucket costs up
    /// post-order so each resource holds the sum of its subtree.
    pub fn calculate_costs(&mut self) -> Result<Decimal> {
        let mut total = Decimal::ZERO;
        for c in &mut self.cost_components {
            c.calculate_costs()
                .with_context(|| format!("{} / {}", self.name, c.name))?;
            total = add(total, c.effective_bucket_cost().unwrap_or(Decimal::ZERO))?;
        }
        for sub in &mut self.sub_resources {
            total = add(total, sub.calculate_costs()?)?;
        }
        self.bucket_cost = total;
        Ok(total)
    }
}

/// Reconcile and total every resource. Returns the overall total of the
/// resources that are not skipped.
pub fn calculate_costs(resources: &mut [Resource]) -> Result<Decimal> {
    let mut overall = Decimal::ZERO;
    for r in resources.iter_mut() {
        let total = r.calculate_costs()?;
        if !r.is_skipped {
            overall = add(overall, total).context("Overall total overflowed")?;
        }
    }
    Ok(overall)
}

/// Order resources (and, recursively, sub-resources) by name. Grouping goes
/// through unordered maps, so this must run before rendering.
pub fn sort_resources(resources: &mut [Resource]) {
    resources.sort_by(|a, b| a.name.cmp(&b.name));
    for r in resources.iter_mut() {
        sort_resources(&mut r.sub_resources);
    }
}
