//! treecosi CLI
//!
//! Drives local collective-signing runs:
//! - generate a roster with one keypair per signer
//! - produce and verify an aggregate signature over a proposal

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use treecosi_core::cosi::{self, CompletePolicy};
use treecosi_core::protocol::{collective_sign, ProtocolConfig};
use treecosi_core::tree::{Roster, Signer};
use treecosi_core::LocalRunner;

/// treecosi - collective signing over a two-level signer tree
#[derive(Parser)]
#[command(name = "treecosi")]
#[command(about = "Collective signing over a two-level signer tree")]
#[command(version)]
struct Cli {
    /// Data directory for the roster and key files
    #[arg(short, long, env = "TREECOSI_DIR", default_value = "./data")]
    dest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a local roster and its private keys
    Keygen {
        /// Number of signers
        #[arg(short, long)]
        nodes: usize,
    },

    /// Produce a collective signature over a proposal
    Sign {
        /// Proposal to sign (hex encoded)
        #[arg(short, long)]
        proposal: String,

        /// Number of shards to split the roster into
        #[arg(short = 'k', long, default_value_t = 1)]
        shards: usize,

        /// Bound on commit and response collection, in milliseconds
        #[arg(long, default_value_t = 10_000)]
        protocol_timeout_ms: u64,

        /// Bound on a shard root waiting for its subleader, in milliseconds
        #[arg(long, default_value_t = 2_000)]
        subleader_timeout_ms: u64,

        /// Bound on a subleader waiting for its leaves, in milliseconds
        #[arg(long, default_value_t = 1_000)]
        leaves_timeout_ms: u64,
    },

    /// Show the saved roster
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.dest)?;

    match cli.command {
        Commands::Keygen { nodes } => run_keygen(&cli.dest, nodes),
        Commands::Sign {
            ref proposal,
            shards,
            protocol_timeout_ms,
            subleader_timeout_ms,
            leaves_timeout_ms,
        } => {
            let config = ProtocolConfig {
                n_subtrees: shards,
                protocol_timeout: Duration::from_millis(protocol_timeout_ms),
                subleader_timeout: Duration::from_millis(subleader_timeout_ms),
                leaves_timeout: Duration::from_millis(leaves_timeout_ms),
            };
            run_sign(&cli.dest, proposal, config).await
        }
        Commands::Info => show_info(&cli.dest),
    }
}

fn roster_path(dest: &Path) -> PathBuf {
    dest.join("roster.json")
}

fn keys_path(dest: &Path) -> PathBuf {
    dest.join("keys.json")
}

fn run_keygen(dest: &Path, nodes: usize) -> Result<()> {
    let runner = LocalRunner::new(nodes)?;

    let roster_json = serde_json::to_string_pretty(runner.roster().list())?;
    std::fs::write(roster_path(dest), roster_json)?;

    let keys: Vec<String> = (0..nodes)
        .map(|index| {
            let keypair = runner.keypair(index)?;
            Ok(hex::encode(cosi::scalar_to_bytes(&keypair.private)))
        })
        .collect::<Result<_>>()?;
    std::fs::write(keys_path(dest), serde_json::to_string_pretty(&keys)?)?;

    info!(
        nodes,
        roster = %roster_path(dest).display(),
        "roster generated"
    );
    println!("Generated a roster of {nodes} signers in {}", dest.display());

    Ok(())
}

fn load_runner(dest: &Path) -> Result<LocalRunner> {
    let roster_json = std::fs::read_to_string(roster_path(dest))
        .with_context(|| format!("no roster in {}; run keygen first", dest.display()))?;
    let signers: Vec<Signer> = serde_json::from_str(&roster_json)?;
    let roster = Roster::new(signers)?;

    let keys_json = std::fs::read_to_string(keys_path(dest))?;
    let keys: Vec<String> = serde_json::from_str(&keys_json)?;
    let privates = keys
        .iter()
        .map(|encoded| Ok(cosi::scalar_from_bytes(&hex::decode(encoded)?)?))
        .collect::<Result<Vec<_>>>()?;

    Ok(LocalRunner::from_parts(roster, privates)?)
}

async fn run_sign(dest: &Path, proposal: &str, config: ProtocolConfig) -> Result<()> {
    let proposal = hex::decode(proposal).context("proposal must be hex encoded")?;

    let runner = Arc::new(load_runner(dest)?);
    let roster = runner.roster().clone();
    let n_nodes = roster.len();
    let publics = roster.publics();
    let leader = runner.keypair(0)?;

    info!(
        nodes = n_nodes,
        shards = config.n_subtrees,
        "starting collective signing"
    );

    let signature =
        collective_sign(runner, roster, n_nodes, leader, &proposal, config).await?;
    cosi::verify(&publics, &proposal, &signature, &CompletePolicy)?;

    info!(bytes = signature.len(), "signature verified");
    println!("Signature: {}", hex::encode(&signature));

    Ok(())
}

fn show_info(dest: &Path) -> Result<()> {
    let runner = load_runner(dest)?;

    println!("Roster ({} signers):", runner.roster().len());
    for (index, signer) in runner.roster().list().iter().enumerate() {
        println!(
            "  [{index}] {} {}",
            signer.address,
            hex::encode(cosi::point_to_bytes(&signer.public))
        );
    }

    Ok(())
}
