//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::curve::math::BPS_DENOMINATOR;
use crate::curve::{CurveParams, SETTLEMENT_UNIT, TOKEN_UNIT};
use crate::fees::{FeePolicy, FeeRecipient, FeeType};

/// EVM-style address accepted for admins and the router
pub const ADDRESS_PATTERN: &str = r"^0x[0-9a-fA-F]{40}$";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub curve: CurveConfig,
    #[serde(default)]
    pub graduation: GraduationConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub fair_launch: FairLaunchDefaults,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Bonding curve shape
#[derive(Debug, Clone, Deserialize)]
pub struct CurveConfig {
    /// `k` in settlement base units per whole token
    #[serde(default = "default_k_per_token")]
    pub k_per_token: u64,
    /// `S_max` in whole tokens
    #[serde(default = "default_max_supply_tokens")]
    pub max_supply_tokens: u64,
}

impl CurveConfig {
    pub fn params(&self) -> CurveParams {
        CurveParams {
            k_per_token: self.k_per_token,
            max_supply_tokens: self.max_supply_tokens,
        }
    }
}

impl Default for CurveConfig {
    fn default() -> Self {
        Self {
            k_per_token: default_k_per_token(),
            max_supply_tokens: default_max_supply_tokens(),
        }
    }
}

/// Graduation thresholds and allocation
#[derive(Debug, Clone, Deserialize)]
pub struct GraduationConfig {
    /// Market cap that triggers graduation, whole USD
    #[serde(default = "default_threshold_usd")]
    pub threshold_usd: u64,
    /// Share of the reserve moved into the pool
    #[serde(default = "default_liquidity_allocation_bps")]
    pub liquidity_allocation_bps: u64,
    /// Share of circulating supply burned from the pool token leg
    #[serde(default)]
    pub graduation_burn_bps: u64,
    /// USD per whole settlement token, operator supplied
    #[serde(default = "default_reference_usd_price")]
    pub reference_usd_price: f64,
    /// Supply fraction shown as graduation progress (display only)
    #[serde(default = "default_display_supply_fraction_bps")]
    pub display_supply_fraction_bps: u64,
}

impl Default for GraduationConfig {
    fn default() -> Self {
        Self {
            threshold_usd: default_threshold_usd(),
            liquidity_allocation_bps: default_liquidity_allocation_bps(),
            graduation_burn_bps: 0,
            reference_usd_price: default_reference_usd_price(),
            display_supply_fraction_bps: default_display_supply_fraction_bps(),
        }
    }
}

/// Default fee schedule for newly launched entities
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_platform_fee_bps")]
    pub platform_fee_bps: u64,
    #[serde(default = "default_creator_fee_bps")]
    pub creator_fee_bps: u64,
    #[serde(default)]
    pub burn_rate_bps: u64,
    #[serde(default)]
    pub auto_liquidity_bps: u64,
    /// Flat platform fee charged at launch, settlement base units
    #[serde(default = "default_creation_fee")]
    pub creation_fee: u64,
    /// Platform fee taken from graduation liquidity
    #[serde(default)]
    pub graduation_fee_bps: u64,
}

impl FeeConfig {
    /// Fee policies installed on a new entity. Burn and auto-liquidity shares
    /// are carried by their own configs.
    pub fn policies(&self) -> Vec<FeePolicy> {
        let mut policies = vec![
            FeePolicy::percentage(FeeType::Trade, FeeRecipient::Platform, self.platform_fee_bps),
            FeePolicy::percentage(FeeType::Trade, FeeRecipient::Creator, self.creator_fee_bps),
        ];
        if self.creation_fee > 0 {
            policies.push(FeePolicy::flat(
                FeeType::Creation,
                FeeRecipient::Platform,
                self.creation_fee,
            ));
        }
        if self.graduation_fee_bps > 0 {
            policies.push(FeePolicy::percentage(
                FeeType::Graduation,
                FeeRecipient::Platform,
                self.graduation_fee_bps,
            ));
        }
        policies
    }

    fn trade_bps(&self) -> u64 {
        self.platform_fee_bps + self.creator_fee_bps + self.burn_rate_bps + self.auto_liquidity_bps
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: default_platform_fee_bps(),
            creator_fee_bps: default_creator_fee_bps(),
            burn_rate_bps: 0,
            auto_liquidity_bps: 0,
            creation_fee: default_creation_fee(),
            graduation_fee_bps: 0,
        }
    }
}

/// Fair-launch defaults for new entities
#[derive(Debug, Clone, Deserialize)]
pub struct FairLaunchDefaults {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds per block when converting anti-snipe blocks to time
    #[serde(default = "default_block_time_secs")]
    pub block_time_secs: u64,
    #[serde(default = "default_max_buy_per_wallet_tokens")]
    pub max_buy_per_wallet_tokens: u64,
    #[serde(default = "default_max_buy_per_tx_tokens")]
    pub max_buy_per_tx_tokens: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_period_seconds: u64,
    #[serde(default = "default_anti_snipe_blocks")]
    pub anti_snipe_blocks: u64,
}

impl Default for FairLaunchDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            block_time_secs: default_block_time_secs(),
            max_buy_per_wallet_tokens: default_max_buy_per_wallet_tokens(),
            max_buy_per_tx_tokens: default_max_buy_per_tx_tokens(),
            cooldown_period_seconds: default_cooldown_secs(),
            anti_snipe_blocks: default_anti_snipe_blocks(),
        }
    }
}

/// Engine behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Addresses that bypass admission
    #[serde(default)]
    pub admins: Vec<String>,
    /// Commit attempts before giving up on a contended entity
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admins: vec![],
            max_commit_retries: default_max_commit_retries(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Chain Execution Service endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_chain_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Curve router contract receiving trade calls
    #[serde(default = "default_router_address")]
    pub router_address: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            endpoint: default_chain_endpoint(),
            api_key: String::new(),
            router_address: default_router_address(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

// Default value functions
fn default_k_per_token() -> u64 {
    crate::curve::price::DEFAULT_K_PER_TOKEN
}

fn default_max_supply_tokens() -> u64 {
    crate::curve::price::DEFAULT_MAX_SUPPLY_TOKENS
}

fn default_threshold_usd() -> u64 {
    100_000
}

fn default_liquidity_allocation_bps() -> u64 {
    1_700
}

fn default_reference_usd_price() -> f64 {
    3_000.0
}

fn default_display_supply_fraction_bps() -> u64 {
    8_000
}

fn default_platform_fee_bps() -> u64 {
    100
}

fn default_creator_fee_bps() -> u64 {
    100
}

fn default_creation_fee() -> u64 {
    // 0.001 settlement tokens
    SETTLEMENT_UNIT / 1_000
}

fn default_block_time_secs() -> u64 {
    crate::fair_launch::DEFAULT_BLOCK_TIME_SECS
}

fn default_max_buy_per_wallet_tokens() -> u64 {
    20_000_000
}

fn default_max_buy_per_tx_tokens() -> u64 {
    10_000_000
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_anti_snipe_blocks() -> u64 {
    3
}

fn default_max_commit_retries() -> u32 {
    8
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_chain_endpoint() -> String {
    std::env::var("CHAIN_EXECUTION_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".into())
}

fn default_router_address() -> String {
    "0x0000000000000000000000000000000000000000".into()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_secs() -> u64 {
    30
}

fn default_snapshot_path() -> String {
    "data/ledger.json".into()
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix LAUNCHPAD_)
            .add_source(
                config::Environment::with_prefix("LAUNCHPAD")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("engine.admins"),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.curve.k_per_token == 0 {
            anyhow::bail!("curve.k_per_token must be positive");
        }
        if self.curve.max_supply_tokens == 0
            || self.curve.max_supply_tokens.checked_mul(TOKEN_UNIT).is_none()
        {
            anyhow::bail!(
                "curve.max_supply_tokens must be between 1 and {}",
                u64::MAX / TOKEN_UNIT
            );
        }

        // Graduation
        if self.graduation.threshold_usd == 0 {
            anyhow::bail!("graduation.threshold_usd must be positive");
        }
        for (name, bps) in [
            ("graduation.liquidity_allocation_bps", self.graduation.liquidity_allocation_bps),
            ("graduation.graduation_burn_bps", self.graduation.graduation_burn_bps),
            ("graduation.display_supply_fraction_bps", self.graduation.display_supply_fraction_bps),
            ("fees.graduation_fee_bps", self.fees.graduation_fee_bps),
        ] {
            if bps > BPS_DENOMINATOR {
                anyhow::bail!("{} cannot exceed 10000 (100%)", name);
            }
        }
        if !self.graduation.reference_usd_price.is_finite() || self.graduation.reference_usd_price <= 0.0 {
            anyhow::bail!("graduation.reference_usd_price must be positive");
        }

        // Trade fees are composed on the same notional, so their sum is the bound
        if self.fees.trade_bps() > BPS_DENOMINATOR {
            anyhow::bail!(
                "combined trade fees of {} bps exceed 10000 (100%)",
                self.fees.trade_bps()
            );
        }

        if self.engine.max_commit_retries == 0 {
            anyhow::bail!("engine.max_commit_retries must be at least 1");
        }

        if self.resilience.failure_threshold == 0 || self.resilience.success_threshold == 0 {
            anyhow::bail!("resilience thresholds must be at least 1");
        }

        // Validate addresses
        let address = regex::Regex::new(ADDRESS_PATTERN).context("Invalid address pattern")?;
        for admin in &self.engine.admins {
            if !address.is_match(admin) {
                anyhow::bail!("Invalid admin address: {}", admin);
            }
        }
        if !address.is_match(&self.chain.router_address) {
            anyhow::bail!("Invalid chain.router_address: {}", self.chain.router_address);
        }

        if self.chain.timeout_ms == 0 {
            anyhow::bail!("chain.timeout_ms must be positive");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Curve:
    k_per_token: {}
    max_supply: {} tokens
  Graduation:
    threshold: ${}
    liquidity_allocation: {}bps
    graduation_burn: {}bps
    reference_price: ${}
  Fees:
    platform: {}bps
    creator: {}bps
    burn: {}bps
    auto_liquidity: {}bps
    creation_fee: {}
    graduation_fee: {}bps
  Fair launch:
    enabled: {}
    block_time: {}s
  Engine:
    admins: {}
    max_commit_retries: {}
  Chain:
    endpoint: {}
    api_key: {}
    router: {}
    timeout: {}ms
  Ledger:
    snapshot: {}
"#,
            self.curve.k_per_token,
            self.curve.max_supply_tokens,
            self.graduation.threshold_usd,
            self.graduation.liquidity_allocation_bps,
            self.graduation.graduation_burn_bps,
            self.graduation.reference_usd_price,
            self.fees.platform_fee_bps,
            self.fees.creator_fee_bps,
            self.fees.burn_rate_bps,
            self.fees.auto_liquidity_bps,
            self.fees.creation_fee,
            self.fees.graduation_fee_bps,
            self.fair_launch.enabled,
            self.fair_launch.block_time_secs,
            self.engine.admins.len(),
            self.engine.max_commit_retries,
            mask_url(&self.chain.endpoint),
            if self.chain.api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.chain.router_address,
            self.chain.timeout_ms,
            self.ledger.snapshot_path,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.graduation.threshold_usd, 100_000);
        assert_eq!(config.graduation.liquidity_allocation_bps, 1_700);
        assert_eq!(config.fees.policies().len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[graduation]
threshold_usd = 50000

[fees]
platform_fee_bps = 50
burn_rate_bps = 25

[engine]
admins = ["0x00000000000000000000000000000000000000aA"]
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.graduation.threshold_usd, 50_000);
        assert_eq!(config.fees.platform_fee_bps, 50);
        assert_eq!(config.fees.creator_fee_bps, 100);
        assert_eq!(config.engine.admins.len(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.fees.platform_fee_bps = 9_950;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.admins = vec!["not-an-address".into()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.graduation.liquidity_allocation_bps = 10_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(mask_url("https://api.example.com"), "https://api.example.com");
    }

    #[test]
    fn test_masked_display_hides_key() {
        let mut config = Config::default();
        config.chain.api_key = "secret".into();
        let display = config.masked_display();
        assert!(display.contains("api_key: ***"));
        assert!(!display.contains("secret"));
    }
}
