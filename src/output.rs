use comfy_table::{presets::NOTHING, Cell, CellAlignment, ContentArrangement, Table};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::types::{CostComponent, Resource};

const BRANCH: &str = "├─";
const TERMINAL: &str = "└─";
const CONTINUE: &str = "│  ";
const SPACER: &str = "   ";

const QUANTITY_DP: u32 = 4;
const COST_DP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Resource,
    Component,
    SubResource,
    Total,
    Blank,
    OverallTotal,
}

/// One report line, already formatted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    #[serde(skip)]
    pub kind: RowKind,
    pub name: String,
    pub quantity: String,
    pub unit: String,
    pub cost: String,
}

impl ReportRow {
    fn new(kind: RowKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            quantity: String::new(),
            unit: String::new(),
            cost: String::new(),
        }
    }

    fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = format_cost(cost);
        self
    }
}

/// Insert thousands separators into the integer part of a plain decimal string.
fn group_thousands(s: &str) -> String {
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", s),
    };
    let (int, frac) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    let mut grouped = String::with_capacity(int.len() + int.len() / 3);
    for (i, ch) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    match frac {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}

/// Up to four decimal places, trailing zeros dropped, e.g. "1,234.5".
pub fn format_quantity(q: Decimal) -> String {
    let rounded = q
        .round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    group_thousands(&rounded.to_string())
}

/// Exactly two decimal places, half away from zero, e.g. "$1,234.57".
pub fn format_cost(c: Decimal) -> String {
    let mut rounded = c.round_dp_with_strategy(COST_DP, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(COST_DP);
    if rounded.is_zero() {
        rounded.set_sign_positive(true);
    }
    let s = group_thousands(&rounded.to_string());
    match s.strip_prefix('-') {
        Some(rest) => format!("-${rest}"),
        None => format!("${s}"),
    }
}

fn component_row(prefix: &str, marker: &str, c: &CostComponent) -> ReportRow {
    ReportRow {
        kind: RowKind::Component,
        name: format!("{prefix}{marker} {}", c.name),
        quantity: c.effective_bucket_quantity().map(format_quantity).unwrap_or_default(),
        unit: c.unit.clone(),
        cost: c.effective_bucket_cost().map(format_cost).unwrap_or_default(),
    }
}

/// Components come before sub-resources, so the last component only gets
/// the terminal marker when no sub-resources follow it.
fn push_component_rows(
    rows: &mut Vec<ReportRow>,
    components: &[CostComponent],
    prefix: &str,
    has_sub_resources: bool,
) {
    for (i, c) in components.iter().enumerate() {
        let last = !has_sub_resources && i + 1 == components.len();
        rows.push(component_row(prefix, if last { TERMINAL } else { BRANCH }, c));
    }
}

fn push_sub_resource_rows(rows: &mut Vec<ReportRow>, subs: &[Resource], prefix: &str) {
    for (i, sub) in subs.iter().enumerate() {
        let last = i + 1 == subs.len();
        let marker = if last { TERMINAL } else { BRANCH };
        rows.push(
            ReportRow::new(RowKind::SubResource, format!("{prefix}{marker} {}", sub.name))
                .with_cost(sub.bucket_cost),
        );

        let child_prefix = format!("{prefix}{}", if last { SPACER } else { CONTINUE });
        push_component_rows(
            rows,
            &sub.cost_components,
            &child_prefix,
            !sub.sub_resources.is_empty(),
        );
        push_sub_resource_rows(rows, &sub.sub_resources, &child_prefix);
    }
}

/// Walk sorted, reconciled resources into report rows: per resource a header,
/// its tree, a total and a blank separator; then the overall total.
/// Sub-resource headers carry their subtree cost.
pub fn build_rows(resources: &[Resource]) -> Vec<ReportRow> {
    let mut rows = Vec::new();
    let mut overall = Decimal::ZERO;

    for r in resources.iter().filter(|r| !r.is_skipped) {
        rows.push(ReportRow::new(RowKind::Resource, &r.name));
        push_component_rows(&mut rows, &r.cost_components, "", !r.sub_resources.is_empty());
        push_sub_resource_rows(&mut rows, &r.sub_resources, "");
        rows.push(ReportRow::new(RowKind::Total, "Total").with_cost(r.bucket_cost));
        rows.push(ReportRow::new(RowKind::Blank, ""));
        overall = overall.saturating_add(r.bucket_cost);
    }

    rows.push(ReportRow::new(RowKind::OverallTotal, "OVERALL TOTAL").with_cost(overall));
    rows
}

pub fn render_table(rows: &[ReportRow], bucket_name: &str) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_content_arrangement(ContentArrangement::Disabled);

    table.set_header(vec![
        Cell::new("NAME"),
        Cell::new(format!("{bucket_name} QTY")),
        Cell::new("UNIT"),
        Cell::new(format!("{bucket_name} COST")),
    ]);

    for row in rows {
        table.add_row(vec![
            Cell::new(&row.name),
            Cell::new(&row.quantity),
            Cell::new(&row.unit),
            Cell::new(&row.cost),
        ]);
    }

    for idx in [1, 3] {
        if let Some(col) = table.column_mut(idx) {
            col.set_cell_alignment(CellAlignment::Right);
        }
    }

    table
}

pub fn print_table(rows: &[ReportRow], bucket_name: &str) {
    println!("\n{}", render_table(rows, bucket_name));
}

pub fn print_json(rows: &[ReportRow]) -> anyhow::Result<()> {
    let visible: Vec<&ReportRow> = rows.iter().filter(|r| r.kind != RowKind::Blank).collect();
    println!("{}", serde_json::to_string_pretty(&visible)?);
    Ok(())
}
