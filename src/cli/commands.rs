//! CLI command implementations
//!
//! Every command opens the ledger snapshot, runs against a fresh engine and
//! writes the snapshot back. With `--submit`, events produced by the command
//! are handed to the Chain Execution Service before the snapshot is saved.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use dialoguer::Confirm;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chain::{
    ChainConfirmation, ConfirmationStatus, DispatchOutcome, Dispatcher, HttpChainExecutor,
};
use crate::config::Config;
use crate::curve::{
    format_price, human_to_settlement, human_to_tokens, min_out_with_slippage, price_to_human,
    settlement_to_human, tokens_to_human,
};
use crate::engine::{
    BondingCurveEngine, BuyRequest, CurveStatus, EngineEvent, EventSink, GraduationRecord,
    LaunchRequest, SellRequest, TradeReceipt,
};
use crate::fair_launch::{FairLaunchUpdate, VestingSchedule};
use crate::ledger::InMemoryLedger;
use crate::resilience::BreakerRegistry;

/// Engine over the on-disk ledger for the duration of one command
struct Session {
    config: Config,
    ledger: Arc<InMemoryLedger>,
    engine: Arc<BondingCurveEngine>,
    events: mpsc::Receiver<EngineEvent>,
    snapshot_path: PathBuf,
}

impl Session {
    async fn open(config: &Config) -> Result<Self> {
        let snapshot_path = PathBuf::from(&config.ledger.snapshot_path);
        let ledger = Arc::new(InMemoryLedger::open(&snapshot_path).await?);
        let (sink, events) = EventSink::channel(config.engine.event_channel_capacity);
        let engine = Arc::new(BondingCurveEngine::new(ledger.clone(), config, sink)?);

        Ok(Self {
            config: config.clone(),
            ledger,
            engine,
            events,
            snapshot_path,
        })
    }

    fn dispatcher(&self) -> Result<Dispatcher> {
        let executor = Arc::new(HttpChainExecutor::new(&self.config.chain)?);
        Ok(Dispatcher::new(
            self.engine.clone(),
            executor,
            Arc::new(BreakerRegistry::new(self.config.resilience.clone())),
            &self.config.chain,
        ))
    }

    /// Optionally submit pending events, then persist the ledger
    async fn close(mut self, submit: bool) -> Result<()> {
        if submit {
            let dispatcher = self.dispatcher()?;
            while let Ok(event) = self.events.try_recv() {
                print_outcome(&dispatcher.dispatch(event).await);
            }
        } else {
            let mut pending = 0;
            while self.events.try_recv().is_ok() {
                pending += 1;
            }
            if pending > 0 {
                info!(pending, "Events not submitted (run with --submit to send them)");
            }
        }

        self.ledger.save(&self.snapshot_path).await?;
        Ok(())
    }
}

/// Launch a new token curve
#[allow(clippy::too_many_arguments)]
pub async fn launch(
    config: &Config,
    entity_id: &str,
    name: &str,
    symbol: &str,
    creator: &str,
    token_address: &str,
    payment: Option<f64>,
    fair_launch: bool,
) -> Result<()> {
    let session = Session::open(config).await?;

    let request = LaunchRequest {
        entity_id: entity_id.to_string(),
        name: name.to_string(),
        symbol: symbol.to_string(),
        creator: creator.to_string(),
        token_address: token_address.to_string(),
        creation_payment: payment
            .map(human_to_settlement)
            .unwrap_or(config.fees.creation_fee),
        fair_launch: fair_launch.then(|| FairLaunchUpdate {
            enabled: Some(true),
            ..Default::default()
        }),
    };

    let entity = session.engine.launch(request, Utc::now()).await?;
    println!("\n=== LAUNCHED ===\n");
    println!("Entity:     {}", entity.entity_id());
    println!("Token:      {} ({})", entity.profile.name, entity.profile.symbol);
    println!("Address:    {}", entity.profile.token_address);
    println!("Fair launch: {}", entity.fair_launch.enabled);
    if entity.fair_launch.enabled && !entity.fair_launch.trading_enabled {
        println!("Trading is disabled until `enable-trading {}`", entity.entity_id());
    }

    session.close(false).await
}

/// Preview a trade without touching the ledger
pub async fn quote(config: &Config, entity_id: &str, sell: bool, amount: f64) -> Result<()> {
    let session = Session::open(config).await?;

    if sell {
        let quote = session.engine.quote_sell(entity_id, human_to_tokens(amount)).await?;
        println!("\n=== SELL QUOTE ===\n");
        println!("Tokens in:      {:.4}", tokens_to_human(quote.tokens_in));
        println!("Gross out:      {:.9}", settlement_to_human(quote.gross_settlement));
        println!("Fees:           {:.9}", settlement_to_human(quote.fees.total()));
        println!("Settlement out: {:.9}", settlement_to_human(quote.settlement_out));
        println!("Price:          {}", format_price(price_to_human(quote.execution_price)));
        println!("Impact:         {:.2}%", quote.price_impact_pct);
    } else {
        let quote = session.engine.quote_buy(entity_id, human_to_settlement(amount)).await?;
        println!("\n=== BUY QUOTE ===\n");
        println!("Settlement in: {:.9}", settlement_to_human(quote.settlement_in));
        println!("Fees:          {:.9}", settlement_to_human(quote.fees.total()));
        println!("Tokens out:    {:.4}", tokens_to_human(quote.tokens_out));
        println!("Price:         {}", format_price(price_to_human(quote.execution_price)));
        println!("Impact:        {:.2}%", quote.price_impact_pct);
    }

    // Quotes never mutate; nothing to save
    Ok(())
}

pub async fn buy(
    config: &Config,
    entity_id: &str,
    trader: &str,
    amount: f64,
    slippage_bps: u32,
    tx_ref: Option<String>,
    submit: bool,
) -> Result<()> {
    let session = Session::open(config).await?;
    let settlement_amount = human_to_settlement(amount);

    let quote = session.engine.quote_buy(entity_id, settlement_amount).await?;
    let request = BuyRequest {
        entity_id: entity_id.to_string(),
        trader: trader.to_string(),
        settlement_amount,
        min_tokens_out: min_out_with_slippage(quote.tokens_out, slippage_bps),
        tx_ref,
    };

    let receipt = session.engine.execute_buy(request, Utc::now()).await?;
    print_receipt(&receipt);
    session.close(submit).await
}

pub async fn sell(
    config: &Config,
    entity_id: &str,
    trader: &str,
    amount: f64,
    slippage_bps: u32,
    tx_ref: Option<String>,
    submit: bool,
) -> Result<()> {
    let session = Session::open(config).await?;
    let token_amount = human_to_tokens(amount);

    let quote = session.engine.quote_sell(entity_id, token_amount).await?;
    let request = SellRequest {
        entity_id: entity_id.to_string(),
        trader: trader.to_string(),
        token_amount,
        min_settlement_out: min_out_with_slippage(quote.settlement_out, slippage_bps),
        tx_ref,
    };

    let receipt = session.engine.execute_sell(request, Utc::now()).await?;
    print_receipt(&receipt);
    session.close(submit).await
}

/// Show one curve, or list all of them
pub async fn status(config: &Config, entity_id: Option<&str>) -> Result<()> {
    let session = Session::open(config).await?;

    let Some(entity_id) = entity_id else {
        let ids = session.engine.store().entity_ids().await?;
        println!("\n=== CURVES ({}) ===\n", ids.len());
        for id in ids {
            let report = session.engine.status(&id).await?;
            println!(
                "{:<16} {:<8} {:<12} supply={:.2} reserve={:.4} cap=${:.0}",
                id,
                report.profile.symbol,
                report.curve.status.to_string(),
                tokens_to_human(report.curve.circulating_supply),
                settlement_to_human(report.curve.reserve_balance),
                report.progress.market_cap_usd
            );
        }
        return Ok(());
    };

    let report = session.engine.status(entity_id).await?;
    println!("\n=== {} ({}) ===\n", report.profile.name, report.profile.symbol);
    println!("Status:       {}", report.curve.status);
    println!("Version:      {}", report.version);
    println!("Supply:       {:.4}", tokens_to_human(report.curve.circulating_supply));
    println!("Reserve:      {:.9}", settlement_to_human(report.curve.reserve_balance));
    println!("Spot price:   {}", format_price(price_to_human(report.curve.spot_price)));
    println!("Volume:       {:.9}", settlement_to_human(report.curve.total_volume));
    println!("Trades:       {}", report.curve.total_transactions);
    println!("Holders:      {}", report.curve.holder_count);
    println!("Burned:       {:.4}", tokens_to_human(report.total_burned));
    println!(
        "Pool escrow:  {:.4} tokens, {:.9} settlement",
        tokens_to_human(report.collected_tokens),
        settlement_to_human(report.collected_settlement)
    );
    println!(
        "Market cap:   ${:.2} of ${} ({:.1}%) at ${}",
        report.progress.market_cap_usd,
        report.progress.threshold_usd,
        report.progress.market_cap_bps as f64 / 100.0,
        report.reference_usd_price
    );
    println!(
        "Fees accrued: platform {:.9}, creator {:.9}",
        settlement_to_human(report.accruals.platform),
        settlement_to_human(report.accruals.creator)
    );
    println!(
        "Fair launch:  {} (trading {})",
        if report.fair_launch.enabled { "on" } else { "off" },
        if report.fair_launch.trading_enabled { "enabled" } else { "disabled" }
    );
    if let Some(record) = &report.latest_graduation {
        print_graduation(record);
    }

    Ok(())
}

pub async fn holders(config: &Config, entity_id: &str, limit: usize) -> Result<()> {
    let session = Session::open(config).await?;
    let holders = session.engine.holders(entity_id).await?;

    println!("\n=== HOLDERS ({}) ===\n", holders.len());
    for holder in holders.iter().take(limit) {
        println!(
            "{:<44} {:>20.4}  avg {}",
            holder.address,
            tokens_to_human(holder.balance),
            format_price(price_to_human(holder.average_buy_price))
        );
    }
    Ok(())
}

pub async fn trades(config: &Config, entity_id: &str, limit: usize) -> Result<()> {
    let session = Session::open(config).await?;
    let trades = session.engine.trades(entity_id, limit).await?;

    println!("\n=== TRADES ({}) ===\n", trades.len());
    for trade in &trades {
        println!(
            "{} {:<4} {:<44} in={} out={} price={}",
            trade.timestamp.format("%Y-%m-%d %H:%M:%S"),
            trade.kind.to_string(),
            trade.trader,
            trade.amount_in,
            trade.amount_out,
            format_price(price_to_human(trade.price))
        );
    }
    Ok(())
}

pub async fn pause(config: &Config, entity_id: &str, force: bool) -> Result<()> {
    if !force && !confirm(&format!("Pause trading on {}?", entity_id))? {
        info!("Pause cancelled by user");
        return Ok(());
    }

    let session = Session::open(config).await?;
    let curve = session.engine.pause(entity_id).await?;
    println!("{} is now {}", entity_id, curve.status);
    session.close(false).await
}

pub async fn resume(config: &Config, entity_id: &str, submit: bool) -> Result<()> {
    let session = Session::open(config).await?;
    let curve = session.engine.resume(entity_id, Utc::now()).await?;
    println!("{} is now {}", entity_id, curve.status);
    session.close(submit).await
}

pub async fn blacklist(config: &Config, entity_id: &str, address: &str, remove: bool) -> Result<()> {
    let session = Session::open(config).await?;
    let participant = session
        .engine
        .set_blacklisted(entity_id, address, !remove)
        .await?;
    println!(
        "{} {} on {}",
        participant.buyer,
        if participant.is_blacklisted { "blacklisted" } else { "cleared" },
        entity_id
    );
    session.close(false).await
}

#[allow(clippy::too_many_arguments)]
pub async fn update_fair_launch(
    config: &Config,
    entity_id: &str,
    max_buy_per_wallet: Option<f64>,
    max_buy_per_tx: Option<f64>,
    cooldown_secs: Option<u64>,
    anti_snipe_blocks: Option<u64>,
    vesting: Option<(u64, u64)>,
    enabled: Option<bool>,
) -> Result<()> {
    let session = Session::open(config).await?;
    let update = FairLaunchUpdate {
        max_buy_per_wallet: max_buy_per_wallet.map(human_to_tokens),
        max_buy_per_tx: max_buy_per_tx.map(human_to_tokens),
        cooldown_period_seconds: cooldown_secs,
        anti_snipe_blocks,
        vesting_schedule: vesting.map(|(cliff_seconds, duration_seconds)| VestingSchedule {
            cliff_seconds,
            duration_seconds,
        }),
        enabled,
        launch_time: None,
    };

    let fair_launch = session.engine.update_fair_launch(entity_id, &update).await?;
    println!("\n=== FAIR LAUNCH {} ===\n", entity_id);
    println!("Enabled:        {}", fair_launch.enabled);
    println!("Max per wallet: {:.4}", tokens_to_human(fair_launch.max_buy_per_wallet));
    println!("Max per tx:     {:.4}", tokens_to_human(fair_launch.max_buy_per_tx));
    println!("Cooldown:       {}s", fair_launch.cooldown_period_seconds);
    println!("Anti-snipe:     {} blocks", fair_launch.anti_snipe_blocks);
    if let Some(vesting) = fair_launch.vesting_schedule {
        println!(
            "Vesting:        cliff {}s, full after {}s",
            vesting.cliff_seconds, vesting.duration_seconds
        );
    }
    session.close(false).await
}

pub async fn enable_trading(config: &Config, entity_id: &str) -> Result<()> {
    let session = Session::open(config).await?;
    session.engine.enable_trading(entity_id).await?;
    println!("Trading enabled on {}, fair-launch config is now locked", entity_id);
    session.close(false).await
}

pub async fn graduation_check(
    config: &Config,
    entity_id: &str,
    reference_price: Option<f64>,
    submit: bool,
) -> Result<()> {
    let session = Session::open(config).await?;
    let monitor = session.engine.graduation();
    if let Some(usd) = reference_price {
        monitor.set_reference_price(usd)?;
    }

    match monitor.check(entity_id, Utc::now()).await? {
        Some(record) => print_graduation(&record),
        None => {
            let report = session.engine.status(entity_id).await?;
            println!(
                "{} not graduating: status {}, market cap ${:.2} of ${}",
                entity_id,
                report.curve.status,
                report.progress.market_cap_usd,
                report.progress.threshold_usd
            );
        }
    }
    session.close(submit).await
}

/// Apply a confirmation, either given by the operator or fetched from the service
#[allow(clippy::too_many_arguments)]
pub async fn graduation_confirm(
    config: &Config,
    idempotency_key: &str,
    fetch: bool,
    tx_hash: Option<String>,
    block_number: u64,
    failed: bool,
    pool_address: Option<String>,
    reason: Option<String>,
    force: bool,
) -> Result<()> {
    let session = Session::open(config).await?;

    if fetch {
        let dispatcher = session.dispatcher()?;
        match dispatcher.sync_confirmation(idempotency_key).await? {
            Some(confirmation) => println!(
                "Applied {:?} confirmation for {} (tx {})",
                confirmation.status, idempotency_key, confirmation.tx_hash
            ),
            None => println!("No confirmation available for {}", idempotency_key),
        }
        return session.close(false).await;
    }

    let Some(tx_hash) = tx_hash else {
        anyhow::bail!("--tx-hash is required unless --fetch is given");
    };
    let status = if failed {
        ConfirmationStatus::Failed
    } else {
        ConfirmationStatus::Success
    };

    if !force
        && !confirm(&format!(
            "Record {:?} for {}? This cannot be undone.",
            status, idempotency_key
        ))?
    {
        info!("Confirmation cancelled by user");
        return Ok(());
    }

    let confirmation = ChainConfirmation {
        idempotency_key: idempotency_key.to_string(),
        tx_hash,
        block_number,
        status,
        pool_address,
        reason,
    };
    let record = session
        .engine
        .graduation()
        .confirm(&confirmation, Utc::now())
        .await?;
    print_graduation(&record);
    session.close(false).await
}

pub async fn graduation_retry(config: &Config, entity_id: &str, submit: bool) -> Result<()> {
    let session = Session::open(config).await?;
    let record = session.engine.graduation().retry(entity_id, Utc::now()).await?;
    print_graduation(&record);
    session.close(submit).await
}

/// Re-publish the open graduation request and submit it
pub async fn graduation_redrive(config: &Config, entity_id: &str) -> Result<()> {
    let session = Session::open(config).await?;
    let record = session.engine.graduation().redrive(entity_id).await?;
    print_graduation(&record);
    session.close(true).await
}

/// Submit open graduation requests for every graduating curve
pub async fn dispatch(config: &Config) -> Result<()> {
    let session = Session::open(config).await?;
    let ids = session.engine.store().entity_ids().await?;

    let mut redriven = 0;
    for id in ids {
        let snapshot = session.engine.store().load(&id).await?;
        if snapshot.entity.curve.status != CurveStatus::Graduating {
            continue;
        }
        match session.engine.graduation().redrive(&id).await {
            Ok(_) => redriven += 1,
            Err(e) => warn!(entity = %id, "Nothing to re-drive: {}", e),
        }
    }

    println!("\n=== DISPATCH ({} graduation requests) ===\n", redriven);
    session.close(true).await
}

pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

fn print_receipt(receipt: &TradeReceipt) {
    let trade = &receipt.trade;
    println!("\n=== {} EXECUTED ===\n", trade.kind.to_string().to_uppercase());
    println!("Trade:      {}", trade.id);
    println!("Trader:     {}", trade.trader);
    println!("In:         {}", trade.amount_in);
    println!("Out:        {}", trade.amount_out);
    println!("Price:      {}", format_price(price_to_human(trade.price)));
    println!(
        "Fees:       {:.9}",
        settlement_to_human(trade.fees_applied.iter().map(|c| c.amount).sum())
    );
    println!("Supply now: {:.4}", tokens_to_human(receipt.curve.circulating_supply));
    println!("Spot now:   {}", format_price(price_to_human(receipt.curve.spot_price)));
    if let Some(record) = &receipt.graduation {
        println!("\nGraduation threshold crossed");
        print_graduation(record);
    }
}

fn print_graduation(record: &GraduationRecord) {
    println!("\n--- Graduation attempt {} ({}) ---", record.attempt, record.status);
    println!("Key:           {}", record.idempotency_key());
    println!("Allocation:    {:.9}", settlement_to_human(record.reserve_allocation));
    println!("Pool ETH:      {:.9}", settlement_to_human(record.eth_liquidity));
    println!("Pool tokens:   {:.4}", tokens_to_human(record.token_liquidity));
    println!("Minted:        {:.4}", tokens_to_human(record.tokens_to_mint));
    println!("Burned:        {:.4}", tokens_to_human(record.graduation_burn));
    if let Some(pool) = &record.pool_address {
        println!("Pool:          {}", pool);
    }
    if let Some(reason) = &record.failure_reason {
        println!("Failure:       {}", reason);
    }
}

fn print_outcome(outcome: &DispatchOutcome) {
    match outcome {
        DispatchOutcome::Submitted {
            idempotency_key,
            tx_hash,
        } => println!(
            "submitted {} {}",
            idempotency_key,
            tx_hash.as_deref().unwrap_or("(pending)")
        ),
        DispatchOutcome::Skipped => {}
        DispatchOutcome::Failed {
            idempotency_key,
            error,
        } => println!("FAILED    {} {}", idempotency_key, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATOR: &str = "0x1111111111111111111111111111111111111111";
    const TOKEN: &str = "0x2222222222222222222222222222222222222222";
    const TRADER: &str = "0x3333333333333333333333333333333333333333";

    fn config_in(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.ledger.snapshot_path = dir.path().join("ledger.json").to_string_lossy().into_owned();
        config
    }

    #[test]
    fn test_commands_share_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        tokio_test::block_on(async {
            launch(&config, "tok", "Token", "TOK", CREATOR, TOKEN, None, false)
                .await
                .unwrap();
            buy(&config, "tok", TRADER, 1.0, 100, Some("0xref".into()), false)
                .await
                .unwrap();

            // The reference survives the round trip through the snapshot
            let replay = buy(&config, "tok", TRADER, 1.0, 100, Some("0xref".into()), false).await;
            assert!(replay.is_err());

            pause(&config, "tok", true).await.unwrap();

            let session = Session::open(&config).await.unwrap();
            let report = session.engine.status("tok").await.unwrap();
            assert_eq!(report.curve.total_transactions, 1);
            assert_eq!(report.curve.status, CurveStatus::Paused);
            assert_eq!(session.engine.holders("tok").await.unwrap()[0].address, TRADER);
        });
    }

    #[test]
    fn test_confirm_requires_tx_hash() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        tokio_test::block_on(async {
            let result = graduation_confirm(
                &config,
                "tok:graduation:1",
                false,
                None,
                0,
                false,
                None,
                None,
                true,
            )
            .await;
            assert!(result.is_err());
        });
    }
}
