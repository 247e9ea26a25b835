mod billing;
mod cli;
mod config;
mod cost;
mod output;
mod pricing;
mod resources;
mod types;
mod usage;

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use billing::{BillingPeriod, BillingSource, FileBillingSource, HttpBillingSource};
use cli::{Cli, Command, OutputFormat};
use config::Config;
use pricing::PriceTable;
use resources::{declared_usage, load_specs, ResourceSpec};
use types::Resource;
use usage::{Estimator, HttpMetricsSource, UsageEstimate, UsageMap};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "infratally=warn".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref());

    match cli.command {
        Command::Explore {
            month,
            tags,
            billing_file,
        } => explore(&config, &month, tags.as_deref(), billing_file.as_deref(), &cli.format),
        Command::Estimate {
            resources,
            prices,
            no_estimate,
        } => estimate(&config, &resources, prices.as_deref(), no_estimate, &cli.format),
    }
}

fn billing_source(config: &Config, billing_file: Option<&Path>) -> Result<Box<dyn BillingSource>> {
    if let Some(path) = billing_file {
        return Ok(Box::new(FileBillingSource::new(path)));
    }
    let Some(endpoint) = &config.billing_endpoint else {
        bail!("No billing source: pass --billing-file or set billing_endpoint in the config file");
    };
    Ok(Box::new(HttpBillingSource::new(
        endpoint.as_str(),
        config.request_timeout(),
    )))
}

fn render(resources: &mut [Resource], bucket_name: &str, format: &OutputFormat) -> Result<()> {
    cost::calculate_costs(resources).context("Error calculating costs")?;
    cost::sort_resources(resources);

    let rows = output::build_rows(resources);
    match format {
        OutputFormat::Table => output::print_table(&rows, bucket_name),
        OutputFormat::Json => output::print_json(&rows)?,
    }
    Ok(())
}

fn explore(
    config: &Config,
    period: &BillingPeriod,
    tags: Option<&str>,
    billing_file: Option<&Path>,
    format: &OutputFormat,
) -> Result<()> {
    let filter = tags.and_then(|t| billing::build_filter(&billing::parse_tags(t)));
    let source = billing_source(config, billing_file)?;

    let mut resources = billing::load_resources(source.as_ref(), period, filter)
        .context("Error retrieving cost and usage")?;
    info!(period = %period, services = resources.len(), "grouped billing data");

    render(&mut resources, &period.label(), format)
}

/// Usage keys worth querying: declared ones not already given explicitly.
fn keys_to_estimate(spec: &ResourceSpec) -> Vec<&'static str> {
    spec.usage_keys()
        .into_iter()
        .filter(|k| !spec.usage.contains_key(*k))
        .collect()
}

fn estimate_usage(
    config: &Config,
    specs: &[ResourceSpec],
    resources: &mut [Resource],
) -> Result<()> {
    let Some(endpoint) = &config.metrics_endpoint else {
        warn!("metrics_endpoint not configured, using explicit usage only");
        return Ok(());
    };
    let source = HttpMetricsSource::new(endpoint.as_str(), config.request_timeout());
    let estimator = Estimator::new(config.usage_workers(), &source)?;

    let mut owners = Vec::new();
    let mut jobs: Vec<(UsageEstimate, Vec<&str>)> = Vec::new();
    for (i, (spec, r)) in specs.iter().zip(resources.iter()).enumerate() {
        let Some(estimate) = &r.usage_estimate else {
            continue;
        };
        let keys = keys_to_estimate(spec);
        if keys.is_empty() {
            continue;
        }
        owners.push(i);
        jobs.push((estimate.clone(), keys));
    }

    let maps = estimator.estimate_all(&jobs);
    for (i, usage) in owners.into_iter().zip(maps) {
        info!(
            address = %specs[i].address,
            usage = ?declared_usage(&specs[i], &usage),
            "estimated usage"
        );
        resources[i] = specs[i].build(&usage)?;
    }
    Ok(())
}

fn estimate(
    config: &Config,
    resources_file: &Path,
    prices_file: Option<&Path>,
    no_estimate: bool,
    format: &OutputFormat,
) -> Result<()> {
    let specs = load_specs(resources_file)?;
    if specs.is_empty() {
        eprintln!("No resources declared in {}.", resources_file.display());
        return Ok(());
    }

    let mut resources = specs
        .iter()
        .map(|s| s.build(&UsageMap::new()))
        .collect::<Result<Vec<Resource>>>()?;
    if !no_estimate {
        estimate_usage(config, &specs, &mut resources)?;
    }

    let mut prices = PriceTable::with_defaults();
    prices.extend(&config.prices);
    if let Some(path) = prices_file {
        prices.extend_from_file(path)?;
    }
    pricing::apply_prices(&mut resources, &prices, config.strict_prices)?;

    render(&mut resources, "Monthly", format)
}
