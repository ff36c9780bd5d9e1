//! Launchpad operator CLI
//!
//! Runs curve operations against the ledger snapshot configured in
//! `[ledger]`. Chain submission only happens with `--submit` or the
//! dispatch commands.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use launchpad_core::cli::commands;
use launchpad_core::config::Config;

/// Bonding-curve launchpad
#[derive(Parser)]
#[command(name = "launchpad")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "launchpad.toml", env = "LAUNCHPAD_CONFIG")]
    config: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a new token curve
    Launch {
        /// Entity id (no ':')
        entity: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        symbol: String,

        /// Creator address
        #[arg(long)]
        creator: String,

        /// Deployed token contract address
        #[arg(long)]
        token_address: String,

        /// Creation payment in ETH (default: configured creation fee)
        #[arg(long)]
        payment: Option<f64>,

        /// Start with fair-launch admission enabled and trading disabled
        #[arg(long)]
        fair_launch: bool,
    },

    /// Preview a buy (ETH in) or sell (tokens in)
    Quote {
        entity: String,

        amount: f64,

        #[arg(long)]
        sell: bool,
    },

    /// Buy tokens with ETH
    Buy {
        entity: String,

        /// ETH to spend, fees included
        amount: f64,

        #[arg(long)]
        trader: String,

        /// Slippage tolerance against the quote
        #[arg(long, default_value = "100")]
        slippage_bps: u32,

        /// Transaction reference, used as the idempotency key
        #[arg(long)]
        tx_ref: Option<String>,

        /// Submit the trade to the Chain Execution Service
        #[arg(long)]
        submit: bool,
    },

    /// Sell tokens for ETH
    Sell {
        entity: String,

        /// Tokens to sell
        amount: f64,

        #[arg(long)]
        trader: String,

        #[arg(long, default_value = "100")]
        slippage_bps: u32,

        #[arg(long)]
        tx_ref: Option<String>,

        #[arg(long)]
        submit: bool,
    },

    /// Show a curve, or list all curves
    Status { entity: Option<String> },

    /// Largest holders first
    Holders {
        entity: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Most recent trades first
    Trades {
        entity: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Halt trading on a curve
    Pause {
        entity: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Resume a paused curve
    Resume {
        entity: String,

        #[arg(long)]
        submit: bool,
    },

    /// Blacklist an address, or clear it with --remove
    Blacklist {
        entity: String,

        address: String,

        #[arg(long)]
        remove: bool,
    },

    /// Update fair-launch settings (only before trading is enabled)
    FairLaunch {
        entity: String,

        /// Tokens per wallet
        #[arg(long)]
        max_per_wallet: Option<f64>,

        /// Tokens per transaction
        #[arg(long)]
        max_per_tx: Option<f64>,

        #[arg(long)]
        cooldown_secs: Option<u64>,

        #[arg(long)]
        anti_snipe_blocks: Option<u64>,

        /// Vesting cliff in seconds, requires --vesting-duration-secs
        #[arg(long, requires = "vesting_duration_secs")]
        vesting_cliff_secs: Option<u64>,

        #[arg(long, requires = "vesting_cliff_secs")]
        vesting_duration_secs: Option<u64>,

        #[arg(long)]
        enabled: Option<bool>,
    },

    /// Open trading and lock the fair-launch config
    EnableTrading { entity: String },

    /// Graduation management
    Graduation {
        #[command(subcommand)]
        action: GraduationAction,
    },

    /// Submit open graduation requests to the Chain Execution Service
    Dispatch,

    /// Show current configuration (secrets masked)
    Config,
}

#[derive(Subcommand)]
enum GraduationAction {
    /// Evaluate the graduation threshold
    Check {
        entity: String,

        /// Override the reference ETH price in USD
        #[arg(long)]
        reference_price: Option<f64>,

        #[arg(long)]
        submit: bool,
    },

    /// Record a chain confirmation for an attempt
    Confirm {
        /// Idempotency key, `<entity>:graduation:<attempt>`
        key: String,

        /// Fetch the confirmation from the Chain Execution Service
        #[arg(long)]
        fetch: bool,

        #[arg(long, required_unless_present = "fetch")]
        tx_hash: Option<String>,

        #[arg(long, default_value = "0")]
        block: u64,

        /// Record a failed attempt
        #[arg(long)]
        failed: bool,

        #[arg(long)]
        pool_address: Option<String>,

        #[arg(long)]
        reason: Option<String>,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Start a new attempt after a failure
    Retry {
        entity: String,

        #[arg(long)]
        submit: bool,
    },

    /// Re-submit the open attempt
    Redrive { entity: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.json)?;

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Launch {
            entity,
            name,
            symbol,
            creator,
            token_address,
            payment,
            fair_launch,
        } => {
            commands::launch(
                &config,
                &entity,
                &name,
                &symbol,
                &creator,
                &token_address,
                payment,
                fair_launch,
            )
            .await
        }
        Commands::Quote { entity, amount, sell } => {
            commands::quote(&config, &entity, sell, amount).await
        }
        Commands::Buy {
            entity,
            amount,
            trader,
            slippage_bps,
            tx_ref,
            submit,
        } => commands::buy(&config, &entity, &trader, amount, slippage_bps, tx_ref, submit).await,
        Commands::Sell {
            entity,
            amount,
            trader,
            slippage_bps,
            tx_ref,
            submit,
        } => commands::sell(&config, &entity, &trader, amount, slippage_bps, tx_ref, submit).await,
        Commands::Status { entity } => commands::status(&config, entity.as_deref()).await,
        Commands::Holders { entity, limit } => commands::holders(&config, &entity, limit).await,
        Commands::Trades { entity, limit } => commands::trades(&config, &entity, limit).await,
        Commands::Pause { entity, force } => commands::pause(&config, &entity, force).await,
        Commands::Resume { entity, submit } => commands::resume(&config, &entity, submit).await,
        Commands::Blacklist {
            entity,
            address,
            remove,
        } => commands::blacklist(&config, &entity, &address, remove).await,
        Commands::FairLaunch {
            entity,
            max_per_wallet,
            max_per_tx,
            cooldown_secs,
            anti_snipe_blocks,
            vesting_cliff_secs,
            vesting_duration_secs,
            enabled,
        } => {
            let vesting = vesting_cliff_secs.zip(vesting_duration_secs);
            commands::update_fair_launch(
                &config,
                &entity,
                max_per_wallet,
                max_per_tx,
                cooldown_secs,
                anti_snipe_blocks,
                vesting,
                enabled,
            )
            .await
        }
        Commands::EnableTrading { entity } => commands::enable_trading(&config, &entity).await,
        Commands::Graduation { action } => match action {
            GraduationAction::Check {
                entity,
                reference_price,
                submit,
            } => commands::graduation_check(&config, &entity, reference_price, submit).await,
            GraduationAction::Confirm {
                key,
                fetch,
                tx_hash,
                block,
                failed,
                pool_address,
                reason,
                force,
            } => {
                commands::graduation_confirm(
                    &config,
                    &key,
                    fetch,
                    tx_hash,
                    block,
                    failed,
                    pool_address,
                    reason,
                    force,
                )
                .await
            }
            GraduationAction::Retry { entity, submit } => {
                commands::graduation_retry(&config, &entity, submit).await
            }
            GraduationAction::Redrive { entity } => {
                commands::graduation_redrive(&config, &entity).await
            }
        },
        Commands::Dispatch => commands::dispatch(&config).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("launchpad_core=info".parse()?);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
    Ok(())
}
