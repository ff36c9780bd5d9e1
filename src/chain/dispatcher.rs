//! Post-commit dispatch of engine events
//!
//! Runs outside every mutation boundary. Trade payloads are retried with
//! exponential backoff while the failure is transient; graduation payloads get
//! a single attempt, and a stuck graduation is re-driven by an operator.

use std::sync::Arc;
use std::time::Duration;

use backoff::{future::retry, ExponentialBackoff};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::payload::{self, ChainPayload};
use super::{ChainConfirmation, ChainExecutor, Submission};
use crate::config::ChainConfig;
use crate::engine::{BondingCurveEngine, EngineEvent, GraduationRecord};
use crate::error::{Error, Result};
use crate::resilience::BreakerRegistry;

/// What happened to one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Submitted {
        idempotency_key: String,
        tx_hash: Option<String>,
    },
    /// Nothing to send for this event
    Skipped,
    Failed {
        idempotency_key: String,
        error: String,
    },
}

/// Counters over a dispatch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub processed: u64,
    pub submitted: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct Dispatcher {
    engine: Arc<BondingCurveEngine>,
    executor: Arc<dyn ChainExecutor>,
    breakers: Arc<BreakerRegistry>,
    router_address: String,
    timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<BondingCurveEngine>,
        executor: Arc<dyn ChainExecutor>,
        breakers: Arc<BreakerRegistry>,
        config: &ChainConfig,
    ) -> Self {
        Self {
            engine,
            executor,
            breakers,
            router_address: config.router_address.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// Dispatch events until every sender is gone
    pub async fn run(&self, mut events: mpsc::Receiver<EngineEvent>) -> DispatchStats {
        let mut stats = DispatchStats::default();
        info!(endpoint = %self.executor.endpoint(), "Dispatcher started");

        while let Some(event) = events.recv().await {
            stats.processed += 1;
            match self.dispatch(event).await {
                DispatchOutcome::Submitted { .. } => stats.submitted += 1,
                DispatchOutcome::Skipped => stats.skipped += 1,
                DispatchOutcome::Failed { .. } => stats.failed += 1,
            }
        }

        info!(
            processed = stats.processed,
            submitted = stats.submitted,
            failed = stats.failed,
            "Dispatcher stopped"
        );
        stats
    }

    pub async fn dispatch(&self, event: EngineEvent) -> DispatchOutcome {
        match event {
            EngineEvent::TradeExecuted(trade) => {
                let call = match payload::trade_call(&self.router_address, &trade) {
                    Ok(call) => call,
                    Err(e) => {
                        error!(entity = %trade.entity_id, "Failed to build trade payload: {}", e);
                        return DispatchOutcome::Failed {
                            idempotency_key: trade.idempotency_key,
                            error: e.to_string(),
                        };
                    }
                };
                let payload = ChainPayload::Trade(call);
                let result = self.submit_with_retry(&payload).await;
                self.outcome(&trade.entity_id, &payload, result)
            }
            EngineEvent::GraduationRequested {
                token_address,
                record,
            } => self.dispatch_graduation(&token_address, &record).await,
            EngineEvent::Graduated {
                entity_id,
                pool_address,
            } => {
                debug!(entity = %entity_id, pool = %pool_address, "Graduation settled");
                DispatchOutcome::Skipped
            }
            EngineEvent::GraduationFailed {
                entity_id, attempt, ..
            } => {
                debug!(entity = %entity_id, attempt, "Graduation attempt failed, awaiting operator");
                DispatchOutcome::Skipped
            }
        }
    }

    async fn dispatch_graduation(&self, token_address: &str, record: &GraduationRecord) -> DispatchOutcome {
        let payload = ChainPayload::Graduation(payload::graduation_call(token_address, record));
        let result = self.submit_guarded(&payload).await;

        if result.is_ok() {
            if let Err(e) = self
                .engine
                .graduation()
                .mark_processing(&record.entity_id, record.attempt, Utc::now())
                .await
            {
                warn!(
                    entity = %record.entity_id,
                    attempt = record.attempt,
                    "Could not mark graduation processing: {}",
                    e
                );
            }
        }
        self.outcome(&record.entity_id, &payload, result)
    }

    fn outcome(&self, entity_id: &str, payload: &ChainPayload, result: Result<Submission>) -> DispatchOutcome {
        let idempotency_key = payload.idempotency_key().to_string();
        match result {
            Ok(submission) => {
                info!(
                    entity = %entity_id,
                    key = %idempotency_key,
                    tx = ?submission.tx_hash,
                    "Payload submitted"
                );
                DispatchOutcome::Submitted {
                    idempotency_key,
                    tx_hash: submission.tx_hash,
                }
            }
            Err(e) => {
                error!(entity = %entity_id, key = %idempotency_key, "Payload not submitted: {}", e);
                DispatchOutcome::Failed {
                    idempotency_key,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn submit_with_retry(&self, payload: &ChainPayload) -> Result<Submission> {
        let backoff = ExponentialBackoff {
            current_interval: self.retry_base_delay,
            initial_interval: self.retry_base_delay,
            max_interval: self.retry_base_delay * 4,
            max_elapsed_time: Some(self.timeout * (self.max_retries + 1)),
            ..Default::default()
        };

        let max_attempts = self.max_retries + 1;
        let mut attempt = 0u32;
        retry(backoff, || {
            attempt += 1;
            let current = attempt;
            async move {
                match self.submit_guarded(payload).await {
                    Ok(submission) => Ok(submission),
                    Err(e) if e.is_retryable() && current < max_attempts => {
                        warn!(
                            key = %payload.idempotency_key(),
                            attempt = current,
                            "Retryable chain error: {}",
                            e
                        );
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }

    /// One attempt through the endpoint's breaker, bounded by the timeout
    async fn submit_guarded(&self, payload: &ChainPayload) -> Result<Submission> {
        self.breakers
            .call(self.executor.endpoint(), || self.submit_once(payload))
            .await
    }

    async fn submit_once(&self, payload: &ChainPayload) -> Result<Submission> {
        tokio::time::timeout(self.timeout, self.executor.submit(payload))
            .await
            .map_err(|_| Error::ChainTimeout(self.timeout.as_millis() as u64))?
    }

    /// Fetch the confirmation for `idempotency_key` and apply it.
    ///
    /// Graduation confirmations drive the graduation record; trade
    /// confirmations are only logged since the ledger is already final.
    pub async fn sync_confirmation(&self, idempotency_key: &str) -> Result<Option<ChainConfirmation>> {
        let confirmation = self
            .breakers
            .call(self.executor.endpoint(), || self.fetch_confirmation(idempotency_key))
            .await?;

        let Some(confirmation) = confirmation else {
            debug!(key = %idempotency_key, "No confirmation yet");
            return Ok(None);
        };

        if GraduationRecord::parse_idempotency_key(idempotency_key).is_some() {
            self.engine.graduation().confirm(&confirmation, Utc::now()).await?;
        } else {
            info!(
                key = %idempotency_key,
                tx = %confirmation.tx_hash,
                block = confirmation.block_number,
                status = ?confirmation.status,
                "Trade confirmation"
            );
        }
        Ok(Some(confirmation))
    }

    async fn fetch_confirmation(&self, idempotency_key: &str) -> Result<Option<ChainConfirmation>> {
        tokio::time::timeout(self.timeout, self.executor.confirmation(idempotency_key))
            .await
            .map_err(|_| Error::ChainTimeout(self.timeout.as_millis() as u64))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ConfirmationStatus;
    use crate::config::{Config, ResilienceConfig};
    use crate::curve::SETTLEMENT_UNIT;
    use crate::engine::{BuyRequest, EventSink, GraduationStatus, LaunchRequest};
    use crate::ledger::InMemoryLedger;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Executor that fails the first `failures` calls
    struct MockExecutor {
        submitted: Mutex<Vec<ChainPayload>>,
        calls: AtomicU32,
        failures: AtomicU32,
        confirmation: Mutex<Option<ChainConfirmation>>,
    }

    impl MockExecutor {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                submitted: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
                failures: AtomicU32::new(failures),
                confirmation: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ChainExecutor for MockExecutor {
        fn endpoint(&self) -> &str {
            "mock"
        }

        async fn submit(&self, payload: &ChainPayload) -> Result<Submission> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::ChainExecution("503 Service Unavailable".into()));
            }
            self.submitted.lock().unwrap().push(payload.clone());
            Ok(Submission {
                idempotency_key: payload.idempotency_key().to_string(),
                tx_hash: Some("0xfeed".into()),
            })
        }

        async fn confirmation(&self, _idempotency_key: &str) -> Result<Option<ChainConfirmation>> {
            Ok(self.confirmation.lock().unwrap().clone())
        }
    }

    fn chain_config() -> ChainConfig {
        ChainConfig {
            endpoint: "http://127.0.0.1:8080".into(),
            api_key: String::new(),
            router_address: "0x9999999999999999999999999999999999999999".into(),
            timeout_ms: 1_000,
            max_retries: 3,
            retry_base_delay_ms: 1,
        }
    }

    async fn setup(
        executor: Arc<MockExecutor>,
        resilience: ResilienceConfig,
    ) -> (Dispatcher, Arc<BondingCurveEngine>, mpsc::Receiver<EngineEvent>) {
        let (events, rx) = EventSink::channel(64);
        let engine = Arc::new(
            BondingCurveEngine::new(Arc::new(InMemoryLedger::new()), &Config::default(), events).unwrap(),
        );
        engine
            .launch(
                LaunchRequest {
                    entity_id: "tok".into(),
                    name: "Token".into(),
                    symbol: "TOK".into(),
                    creator: "0x1111111111111111111111111111111111111111".into(),
                    token_address: "0x2222222222222222222222222222222222222222".into(),
                    creation_payment: SETTLEMENT_UNIT / 1_000,
                    fair_launch: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(
            engine.clone(),
            executor,
            Arc::new(BreakerRegistry::new(resilience)),
            &chain_config(),
        );
        (dispatcher, engine, rx)
    }

    async fn buy(engine: &BondingCurveEngine, amount: u64) {
        engine
            .execute_buy(
                BuyRequest {
                    entity_id: "tok".into(),
                    trader: "0x3333333333333333333333333333333333333333".into(),
                    settlement_amount: amount,
                    min_tokens_out: 0,
                    tx_ref: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_trade_payload_retried() {
        let executor = MockExecutor::failing(2);
        let (dispatcher, engine, mut rx) = setup(executor.clone(), ResilienceConfig::default()).await;

        buy(&engine, SETTLEMENT_UNIT).await;
        let outcome = dispatcher.dispatch(rx.try_recv().unwrap()).await;

        assert!(matches!(outcome, DispatchOutcome::Submitted { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        let submitted = executor.submitted.lock().unwrap();
        match &submitted[0] {
            ChainPayload::Trade(call) => {
                assert_eq!(call.to, "0x9999999999999999999999999999999999999999");
                assert_eq!(call.value, "1000000000000000000");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trade_payload_gives_up() {
        let executor = MockExecutor::failing(10);
        let (dispatcher, engine, mut rx) = setup(executor.clone(), ResilienceConfig::default()).await;

        buy(&engine, SETTLEMENT_UNIT).await;
        let outcome = dispatcher.dispatch(rx.try_recv().unwrap()).await;

        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_graduation_single_attempt() {
        let executor = MockExecutor::failing(1);
        let (dispatcher, engine, mut rx) = setup(executor.clone(), ResilienceConfig::default()).await;

        buy(&engine, 15 * SETTLEMENT_UNIT).await;
        let _trade = rx.try_recv().unwrap();
        let request = rx.try_recv().unwrap();
        assert!(matches!(request, EngineEvent::GraduationRequested { .. }));

        let outcome = dispatcher.dispatch(request).await;
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let snapshot = engine.store().load("tok").await.unwrap();
        assert_eq!(snapshot.entity.graduations[0].status, GraduationStatus::Pending);

        // Operator re-drive goes through
        engine.graduation().redrive("tok").await.unwrap();
        let outcome = dispatcher.dispatch(rx.try_recv().unwrap()).await;
        assert!(matches!(outcome, DispatchOutcome::Submitted { .. }));

        let snapshot = engine.store().load("tok").await.unwrap();
        assert_eq!(snapshot.entity.graduations[0].status, GraduationStatus::Processing);
    }

    #[tokio::test]
    async fn test_graduation_confirmation_sync() {
        let executor = MockExecutor::failing(0);
        let (dispatcher, engine, mut rx) = setup(executor.clone(), ResilienceConfig::default()).await;

        buy(&engine, 15 * SETTLEMENT_UNIT).await;
        let _trade = rx.try_recv().unwrap();
        dispatcher.dispatch(rx.try_recv().unwrap()).await;

        assert!(dispatcher.sync_confirmation("tok:graduation:1").await.unwrap().is_none());

        *executor.confirmation.lock().unwrap() = Some(ChainConfirmation {
            idempotency_key: "tok:graduation:1".into(),
            tx_hash: "0xabc".into(),
            block_number: 7,
            status: ConfirmationStatus::Success,
            pool_address: Some("0xpool".into()),
            reason: None,
        });
        dispatcher.sync_confirmation("tok:graduation:1").await.unwrap().unwrap();

        let report = engine.status("tok").await.unwrap();
        assert_eq!(report.curve.status, crate::engine::CurveStatus::Graduated);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let executor = MockExecutor::failing(100);
        let resilience = ResilienceConfig {
            failure_threshold: 2,
            success_threshold: 1,
            open_timeout_secs: 60,
        };
        let (dispatcher, engine, mut rx) = setup(executor.clone(), resilience).await;

        buy(&engine, SETTLEMENT_UNIT).await;
        let outcome = dispatcher.dispatch(rx.try_recv().unwrap()).await;

        // Two transient failures open the breaker, the third attempt never runs
        match outcome {
            DispatchOutcome::Failed { error, .. } => assert!(error.contains("Circuit open")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let executor = MockExecutor::failing(0);
        let (dispatcher, _engine, _rx) = setup(executor.clone(), ResilienceConfig::default()).await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(EngineEvent::Graduated {
            entity_id: "tok".into(),
            pool_address: "0xpool".into(),
        })
        .await
        .unwrap();
        drop(tx);

        let stats = dispatcher.run(rx).await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }
}
