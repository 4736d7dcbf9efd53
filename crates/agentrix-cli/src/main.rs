//! Agentrix CLI - operator tools for the authorization and settlement core
//!
//! Every command runs in-process against the library crates; nothing here
//! talks to a server.
//!
//! ```bash
//! # Fee and allocation breakdown for a 100 unit skill payment
//! agentrix preview 100 --product-type skill --payment-type onramp \
//!     --recipient '{{executor}}=alice' --recipient '{{referrer}}=bob'
//!
//! # Check an exported audit chain
//! agentrix verify-chain proofs.json
//!
//! # Walk the whole flow end to end
//! agentrix demo --export proofs.json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agentrix_split::{PaymentType, ProductType};

mod commands;
mod display;

use commands::{audit, demo, preview};

/// Agentrix - authorization and settlement integrity for agent payments
#[derive(Parser)]
#[command(name = "agentrix")]
#[command(author = "Agentrix Contributors")]
#[command(version)]
#[command(about = "Spending grants, audit chains, budget pools and payment splits", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Print JSON instead of formatted output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preview fees and allocations for a payment
    Preview {
        /// Payment amount in whole currency units
        amount: Decimal,

        /// Built-in template to use when no plan file is given
        #[arg(long, value_enum, default_value = "skill")]
        product_type: ProductArg,

        /// Split plan JSON file to use instead of a template
        #[arg(long)]
        plan: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "crypto-direct")]
        payment_type: PaymentTypeArg,

        /// Force the split fee on or off
        #[arg(long)]
        split: Option<bool>,

        /// Placeholder substitution, e.g. `{{executor}}=alice`
        #[arg(long = "recipient", value_parser = parse_key_val)]
        recipients: Vec<(String, String)>,
    },

    /// Compute the Merkle root of proof hashes
    MerkleRoot {
        /// Hex-encoded leaf hashes, in order
        leaves: Vec<String>,

        /// Read leaves from a file, one per line
        #[arg(long, conflicts_with = "leaves")]
        file: Option<PathBuf>,
    },

    /// Verify exported audit chains
    VerifyChain {
        /// JSON array of audit proofs
        file: PathBuf,

        /// Externally anchored head hash to compare against
        #[arg(long)]
        anchored_head: Option<String>,
    },

    /// Run a grant, payment, budget and anchoring flow in memory
    Demo {
        /// Write the resulting audit proofs to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProductArg {
    Skill,
    Physical,
    Service,
    Digital,
}

impl From<ProductArg> for ProductType {
    fn from(arg: ProductArg) -> Self {
        match arg {
            ProductArg::Skill => ProductType::Skill,
            ProductArg::Physical => ProductType::Physical,
            ProductArg::Service => ProductType::Service,
            ProductArg::Digital => ProductType::Digital,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PaymentTypeArg {
    CryptoDirect,
    Onramp,
    Offramp,
    Mixed,
}

impl From<PaymentTypeArg> for PaymentType {
    fn from(arg: PaymentTypeArg) -> Self {
        match arg {
            PaymentTypeArg::CryptoDirect => PaymentType::CryptoDirect,
            PaymentTypeArg::Onramp => PaymentType::Onramp,
            PaymentTypeArg::Offramp => PaymentType::Offramp,
            PaymentTypeArg::Mixed => PaymentType::Mixed,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", s))?;
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Preview {
            amount,
            product_type,
            plan,
            payment_type,
            split,
            recipients,
        } => preview::run(
            preview::PreviewArgs {
                amount,
                product_type: product_type.into(),
                plan,
                payment_type: payment_type.into(),
                split,
                recipients: recipients.into_iter().collect(),
            },
            cli.json,
        )?,
        Commands::MerkleRoot { leaves, file } => audit::merkle_root(leaves, file, cli.json)?,
        Commands::VerifyChain { file, anchored_head } => {
            audit::verify_chain(&file, anchored_head.as_deref(), cli.json)?
        }
        Commands::Demo { export } => demo::run(export, cli.json).await?,
    }

    Ok(())
}
