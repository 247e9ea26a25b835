use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::billing::BillingPeriod;

#[derive(Parser, Debug)]
#[command(
    name = "infratally",
    about = "Explore recurring cloud costs from billing and usage data"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output format: table (default), json
    #[arg(long, global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Config file (default: platform config dir/infratally/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show billed costs for one month, grouped by service and usage type
    Explore {
        /// Month to report, e.g. 2020-10
        #[arg(long)]
        month: BillingPeriod,
        /// Tag filter, e.g. SVC=myapp,STAGE=prod
        #[arg(long)]
        tags: Option<String>,
        /// Read a saved cost-and-usage response instead of querying
        #[arg(long)]
        billing_file: Option<PathBuf>,
    },
    /// Estimate monthly costs for declared resources from their metrics
    Estimate {
        /// TOML file with [[resource]] entries
        resources: PathBuf,
        /// JSON file of price key -> unit price overrides
        #[arg(long)]
        prices: Option<PathBuf>,
        /// Only use explicit usage values; skip metric queries
        #[arg(long)]
        no_estimate: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Table,
    Json,
}
