//! Hands decisions to the executor and records the outcome.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::PositionMappingStore;
use crate::models::{Decision, ExecutionRecord, ExecutionStatus};

use super::executor::DecisionExecutor;

/// Drains one follower's decision queue.
pub struct DecisionDispatcher {
    executor: Arc<dyn DecisionExecutor>,
    store: Arc<dyn PositionMappingStore>,
}

impl DecisionDispatcher {
    pub fn new(executor: Arc<dyn DecisionExecutor>, store: Arc<dyn PositionMappingStore>) -> Self {
        Self { executor, store }
    }

    /// Execute decisions until the queue closes or `cancel` fires.
    pub async fn run(self, mut decisions: mpsc::Receiver<Decision>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = decisions.recv() => match next {
                    Some(decision) => { self.dispatch(&decision).await; }
                    None => break,
                }
            }
        }
        info!("Decision dispatcher stopped");
    }

    /// Execute one decision exactly once and record what happened.
    pub async fn dispatch(&self, decision: &Decision) -> ExecutionStatus {
        let record = match self.executor.execute_decision(decision).await {
            Ok(()) => {
                info!(
                    follower = %decision.follower_id,
                    decision = %decision.id,
                    symbol = %decision.symbol,
                    action = decision.action.as_str(),
                    full_close = decision.is_full_close(),
                    "Decision executed"
                );
                ExecutionRecord::for_decision(decision, ExecutionStatus::Executed, None)
            }
            Err(e) => {
                error!(
                    follower = %decision.follower_id,
                    decision = %decision.id,
                    symbol = %decision.symbol,
                    error = %format!("{:#}", e),
                    "Decision execution failed"
                );
                ExecutionRecord::for_decision(decision, ExecutionStatus::Failed, Some(format!("{:#}", e)))
            }
        };

        let status = record.status;
        if let Err(e) = self.store.record_execution(&record).await {
            warn!(decision = %decision.id, error = %e, "Failed to record execution");
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{DecisionAction, MarginMode, PositionKey, PositionSide};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Executor that rejects every order.
    struct RejectingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DecisionExecutor for RejectingExecutor {
        async fn execute_decision(&self, _decision: &Decision) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("insufficient margin")
        }

        async fn get_account_info(&self) -> Result<Map<String, Value>> {
            Ok(Map::new())
        }

        async fn get_positions(&self) -> Result<Vec<Map<String, Value>>> {
            Ok(Vec::new())
        }
    }

    fn decision() -> Decision {
        Decision {
            id: Uuid::new_v4(),
            follower_id: "f1".to_string(),
            leader_id: "leader".to_string(),
            fill_id: "t1".to_string(),
            symbol: "BTCUSDT".to_string(),
            action: DecisionAction::OpenLong,
            size_usd: dec!(100),
            leverage: 10,
            margin_mode: MarginMode::Cross,
            close_ratio: Decimal::ZERO,
            leader_position: PositionKey::composite("BTCUSDT", PositionSide::Long, MarginMode::Cross),
            mapping_id: Some(1),
            rationale: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failure_recorded_without_retry() {
        let executor = Arc::new(RejectingExecutor {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        let dispatcher = DecisionDispatcher::new(executor.clone(), store.clone());

        let status = dispatcher.dispatch(&decision()).await;
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let records = store.executions().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error.as_deref(), Some("insufficient margin"));
    }

    #[tokio::test]
    async fn test_run_drains_until_queue_closes() {
        let executor = Arc::new(crate::trading::DryRunExecutor::new(dec!(1000)));
        let store = Arc::new(MemoryStore::new());
        let dispatcher = DecisionDispatcher::new(executor.clone(), store.clone());

        let (tx, rx) = mpsc::channel(4);
        tx.send(decision()).await.unwrap();
        tx.send(decision()).await.unwrap();
        drop(tx);

        dispatcher.run(rx, CancellationToken::new()).await;

        assert_eq!(executor.executed_count(), 2);
        let records = store.executions().await;
        assert!(records.iter().all(|r| r.status == ExecutionStatus::Executed));
    }
}
