//! Per-follower signal engine: turns leader fills into follower decisions.
//!
//! Pipeline for each fill:
//! 1. Drop fills already seen within the dedup TTL
//! 2. Refresh the leader snapshot when it may be stale
//! 3. Attribute the fill to a followed position (or skip it)
//! 4. Size the copy against the follower's equity
//! 5. Update the mapping and push the decision onto a bounded queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{FeedEvent, LeaderDataSource, ProviderError, StreamingSource};
use crate::db::PositionMappingStore;
use crate::models::{
    AccountState, Decision, DecisionAction, Fill, MappingStatus, MarginMode, Position, PositionKey, PositionMapping,
    TradeSignal, Venue, Warning, WarningKind,
};

use super::dedup::{PollCursor, SeenFills};
use super::executor::{DecisionExecutor, FollowerBalance};
use super::matcher::{match_decrease, match_increase, Candidate, MatchOutcome, MatchRules};
use super::position_sizer::{CopySizer, SizeOutcome, SizingInput};
use super::{CopyConfig, EngineConfig, EngineError};

/// Where an engine gets leader activity from.
#[derive(Clone)]
pub enum LeaderFeed {
    Polling(Arc<dyn LeaderDataSource>),
    Streaming(Arc<dyn StreamingSource>),
}

impl LeaderFeed {
    pub fn venue(&self) -> Venue {
        match self {
            Self::Polling(source) => source.venue(),
            Self::Streaming(source) => source.venue(),
        }
    }

    async fn get_fills(&self, leader_id: &str, since: DateTime<Utc>) -> Result<Vec<Fill>, ProviderError> {
        match self {
            Self::Polling(source) => source.get_fills(leader_id, since).await,
            Self::Streaming(source) => source.get_fills(leader_id, since).await,
        }
    }

    async fn get_account_state(&self, leader_id: &str) -> Result<AccountState, ProviderError> {
        match self {
            Self::Polling(source) => source.get_account_state(leader_id).await,
            Self::Streaming(source) => source.get_account_state(leader_id).await,
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Signal engine for one follower account.
pub struct SignalEngine {
    config: CopyConfig,
    engine_config: EngineConfig,
    feed: LeaderFeed,
    store: Arc<dyn PositionMappingStore>,
    executor: Arc<dyn DecisionExecutor>,
    sizer: CopySizer,
    rules: MatchRules,

    decisions: mpsc::Sender<Decision>,

    // Latest leader snapshot
    leader_state: RwLock<Option<AccountState>>,

    // Fill ids processed recently
    seen: RwLock<SeenFills>,

    // Most recent advisory warnings, oldest first
    warnings: RwLock<VecDeque<Warning>>,

    running: AtomicBool,

    // Held while a fill is processed
    processing: Mutex<()>,

    worker: Mutex<Option<Worker>>,
}

impl SignalEngine {
    /// Create a stopped engine and the receiving end of its decision queue.
    pub fn new(
        config: CopyConfig,
        engine_config: EngineConfig,
        feed: LeaderFeed,
        store: Arc<dyn PositionMappingStore>,
        executor: Arc<dyn DecisionExecutor>,
    ) -> (Self, mpsc::Receiver<Decision>) {
        let (decisions, receiver) = mpsc::channel(engine_config.decision_queue_capacity.max(1));
        let sizer = CopySizer::new(config.copy_ratio, config.min_copy_size, config.max_copy_size);
        let rules = MatchRules {
            near_zero_close_ratio: engine_config.near_zero_close_ratio,
            promote_close_ratio: engine_config.promote_close_ratio,
            virtual_ids: feed.venue().has_virtual_ids(),
        };
        let seen = SeenFills::new(engine_config.dedup_ttl(), engine_config.dedup_prune_threshold);

        let engine = Self {
            config,
            engine_config,
            feed,
            store,
            executor,
            sizer,
            rules,
            decisions,
            leader_state: RwLock::new(None),
            seen: RwLock::new(seen),
            warnings: RwLock::new(VecDeque::new()),
            running: AtomicBool::new(false),
            processing: Mutex::new(()),
            worker: Mutex::new(None),
        };

        (engine, receiver)
    }

    pub fn follower_id(&self) -> &str {
        &self.config.follower_id
    }

    pub fn config(&self) -> &CopyConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Recent advisory warnings, oldest first.
    pub async fn warnings(&self) -> Vec<Warning> {
        self.warnings.read().await.iter().cloned().collect()
    }

    /// Last leader snapshot the engine saw.
    pub async fn leader_state(&self) -> Option<AccountState> {
        self.leader_state.read().await.clone()
    }

    /// Start following the leader.
    ///
    /// Every leader position open right now is registered as ignored and
    /// will never be copied. Only fills from this instant onward are read.
    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) -> Result<(), EngineError> {
        if parent.is_cancelled() {
            return Err(EngineError::ShuttingDown(self.config.follower_id.clone()));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning(self.config.follower_id.clone()));
        }

        let since = Utc::now();
        if let Err(e) = self.register_existing_positions().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(EngineError::Startup {
                follower: self.config.follower_id.clone(),
                message: format!("{:#}", e),
            });
        }

        let cancel = parent.child_token();
        let handle = match &self.feed {
            LeaderFeed::Polling(_) => tokio::spawn(self.clone().poll_loop(since, cancel.clone())),
            LeaderFeed::Streaming(source) => {
                let (events_tx, events_rx) = mpsc::channel(self.engine_config.decision_queue_capacity.max(1));
                let subscription = source.subscribe(&self.config.leader_id, events_tx, cancel.clone());
                tokio::spawn(self.clone().stream_loop(events_rx, subscription, cancel.clone()))
            }
        };
        *self.worker.lock().await = Some(Worker { cancel, handle });

        info!(
            follower = %self.config.follower_id,
            leader = %self.config.leader_id,
            venue = %self.config.venue,
            feed = ?self.config.feed,
            "Signal engine started"
        );
        Ok(())
    }

    /// Stop the ingestion worker. Safe to call on a stopped engine.
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        let was_running = self.running.swap(false, Ordering::SeqCst);

        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!(follower = %self.config.follower_id, error = %e, "Engine worker ended abnormally");
            }
        }

        if was_running {
            info!(follower = %self.config.follower_id, "Signal engine stopped");
        }
    }

    async fn register_existing_positions(&self) -> Result<()> {
        let state = self
            .feed
            .get_account_state(&self.config.leader_id)
            .await
            .context("Failed to fetch leader snapshot")?;

        for position in state.positions.values() {
            self.store
                .save_ignored_position(&self.config.follower_id, &self.config.leader_id, position)
                .await
                .with_context(|| format!("Failed to register pre-existing position {}", position.key()))?;
        }

        info!(
            follower = %self.config.follower_id,
            positions = state.positions.len(),
            "Registered pre-existing leader positions as ignored"
        );

        *self.leader_state.write().await = Some(state);
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>, since: DateTime<Utc>, cancel: CancellationToken) {
        let mut fills_tick = interval(self.engine_config.fill_poll_interval());
        fills_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let state_every = self.engine_config.state_refresh_interval();
        let mut state_tick = interval_at(tokio::time::Instant::now() + state_every, state_every);
        state_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cursor = PollCursor::new(since);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = fills_tick.tick() => {
                    match self.feed.get_fills(&self.config.leader_id, cursor.since()).await {
                        Ok(fills) => {
                            for fill in cursor.advance(fills) {
                                if cancel.is_cancelled() {
                                    break;
                                }
                                self.submit_fill(fill).await;
                            }
                        }
                        Err(e) => warn!(follower = %self.config.follower_id, error = %e, "Fill poll failed"),
                    }
                }
                _ = state_tick.tick() => {
                    if let Err(e) = self.refresh_leader_state().await {
                        warn!(follower = %self.config.follower_id, error = %e, "Leader state refresh failed");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!(follower = %self.config.follower_id, "Poll loop exited");
    }

    async fn stream_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<FeedEvent>,
        subscription: JoinHandle<()>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(FeedEvent::Fill(fill)) => self.submit_fill(fill).await,
                    Some(FeedEvent::Connected) => info!(follower = %self.config.follower_id, "Leader stream connected"),
                    Some(FeedEvent::Disconnected(reason)) => {
                        warn!(follower = %self.config.follower_id, reason = %reason, "Leader stream disconnected");
                    }
                    None => {
                        warn!(follower = %self.config.follower_id, "Leader stream ended");
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        drop(events);
        if let Err(e) = subscription.await {
            warn!(follower = %self.config.follower_id, error = %e, "Stream task ended abnormally");
        }
    }

    /// Feed one leader fill through the pipeline. Failures are logged.
    pub async fn submit_fill(&self, fill: Fill) {
        let fill_id = fill.id.clone();
        if let Err(e) = self.process_fill(fill).await {
            error!(follower = %self.config.follower_id, fill = %fill_id, error = %format!("{:#}", e), "Failed to process fill");
        }
    }

    async fn process_fill(&self, fill: Fill) -> Result<Option<Decision>> {
        let _guard = self.processing.lock().await;

        {
            let mut seen = self.seen.write().await;
            if !seen.insert(&fill.id, Instant::now()) {
                debug!(
                    follower = %self.config.follower_id,
                    fill = %fill.id,
                    seen = seen.len(),
                    "Duplicate fill dropped"
                );
                return Ok(None);
            }
        }

        let state = self.state_for(&fill).await?;
        let mut signal = TradeSignal::new(fill, &state);

        let outcome = self.classify(&signal.fill, &state).await?;
        let decision = match outcome {
            MatchOutcome::Skip { reason } => {
                info!(
                    follower = %self.config.follower_id,
                    fill = %signal.fill.id,
                    symbol = %signal.fill.symbol,
                    side = %signal.fill.position_side,
                    reason = %reason,
                    "Signal not followed"
                );
                return Ok(None);
            }
            MatchOutcome::NewOpen { position } => {
                signal.position = Some(position);
                self.open_decision(&signal, &state).await?
            }
            MatchOutcome::Add {
                mapping,
                position,
                current_size,
            } => {
                signal.position = position;
                signal.mapping_id = Some(mapping.id);
                self.add_decision(&signal, &state, &mapping, current_size).await?
            }
            MatchOutcome::Reduce {
                mapping,
                ratio,
                current_size,
            } => {
                signal.mapping_id = Some(mapping.id);
                signal.position = state.position(&mapping.leader_position).cloned();
                self.store.update_last_known_size(mapping.id, current_size).await?;
                self.store.increment_reduce_count(mapping.id).await?;
                Some(self.exit_decision(&signal, &state, &mapping, ratio))
            }
            MatchOutcome::Close { mapping } => {
                signal.mapping_id = Some(mapping.id);
                self.store.close_mapping(mapping.id).await?;
                Some(self.exit_decision(&signal, &state, &mapping, Decimal::ONE))
            }
        };

        let Some(decision) = decision else {
            return Ok(None);
        };
        self.emit(decision.clone()).await;
        Ok(Some(decision))
    }

    /// Snapshot to classify `fill` against, refreshed when it may be stale.
    async fn state_for(&self, fill: &Fill) -> Result<AccountState> {
        let cached = self.leader_state.read().await.clone();
        let stale = cached.as_ref().map_or(true, |s| s.captured_at < fill.timestamp);

        if !fill.action.needs_fresh_state() && !stale {
            if let Some(state) = cached {
                return Ok(state);
            }
        }

        match self.refresh_leader_state().await {
            Ok(state) => Ok(state),
            Err(e) => match cached {
                Some(state) => {
                    warn!(
                        follower = %self.config.follower_id,
                        fill = %fill.id,
                        error = %e,
                        "Leader state refresh failed, using cached snapshot"
                    );
                    Ok(state)
                }
                None => Err(e).context("No leader snapshot available"),
            },
        }
    }

    async fn refresh_leader_state(&self) -> Result<AccountState, ProviderError> {
        let state = self.feed.get_account_state(&self.config.leader_id).await?;
        *self.leader_state.write().await = Some(state.clone());
        Ok(state)
    }

    async fn classify(&self, fill: &Fill, state: &AccountState) -> Result<MatchOutcome> {
        let follower = self.config.follower_id.as_str();
        let active = self
            .store
            .find_active_by_symbol_side(follower, &fill.symbol, fill.position_side)
            .await?;

        let mut candidates = Vec::new();
        for position in state.positions_for(&fill.symbol, fill.position_side) {
            let mapping = self.store.get_mapping(follower, &position.key()).await?;
            candidates.push(Candidate {
                position: position.clone(),
                mapping,
            });
        }

        let outcome = if fill.action.is_increase() {
            match_increase(fill, state, &candidates, &active, &self.rules)
        } else {
            match_decrease(fill, state, &active, &self.rules)
        };

        // Ignored positions follow the leader too, so a later change on one is
        // seen as growth on that id and never falls back to an owned mapping
        for candidate in &candidates {
            if let Some(mapping) = &candidate.mapping {
                if mapping.status == MappingStatus::Ignored && mapping.last_known_size != candidate.position.size {
                    self.store
                        .update_last_known_size(mapping.id, candidate.position.size)
                        .await?;
                }
            }
        }

        Ok(outcome)
    }

    async fn open_decision(&self, signal: &TradeSignal, state: &AccountState) -> Result<Option<Decision>> {
        let Some(position) = signal.position.as_ref() else {
            return Ok(None);
        };
        let (leverage, margin_mode) = self.resolve_leverage(Some(position), state, &signal.fill);

        let size_usd = match self.size_copy(signal, leverage).await? {
            Some(size) => size,
            None => {
                // Never follow a position we could not open
                self.store
                    .save_ignored_position(&self.config.follower_id, &self.config.leader_id, position)
                    .await?;
                return Ok(None);
            }
        };

        let mapping = PositionMapping::active(
            &self.config.follower_id,
            &self.config.leader_id,
            position,
            signal.fill.price,
        );
        let mapping_id = self.store.save_mapping(&mapping).await?;

        let fill = &signal.fill;
        Ok(Some(Decision {
            size_usd,
            leverage,
            margin_mode,
            mapping_id: Some(mapping_id),
            rationale: format!(
                "leader opened {} {} {} @ {} (new position {})",
                fill.symbol,
                fill.position_side,
                fill.size,
                fill.price,
                position.key()
            ),
            ..self.new_decision(fill, DecisionAction::open(fill.position_side), position.key())
        }))
    }

    async fn add_decision(
        &self,
        signal: &TradeSignal,
        state: &AccountState,
        mapping: &PositionMapping,
        current_size: Decimal,
    ) -> Result<Option<Decision>> {
        let (leverage, margin_mode) = self.resolve_leverage(signal.position.as_ref(), state, &signal.fill);

        // The recorded size follows the leader even when no order is sent
        self.store.update_last_known_size(mapping.id, current_size).await?;

        let Some(size_usd) = self.size_copy(signal, leverage).await? else {
            return Ok(None);
        };
        self.store.increment_add_count(mapping.id).await?;

        let fill = &signal.fill;
        Ok(Some(Decision {
            size_usd,
            leverage,
            margin_mode,
            mapping_id: Some(mapping.id),
            rationale: format!(
                "leader added {} to {} {} ({} -> {})",
                fill.size, fill.symbol, fill.position_side, mapping.last_known_size, current_size
            ),
            ..self.new_decision(fill, DecisionAction::open(fill.position_side), mapping.leader_position.clone())
        }))
    }

    fn exit_decision(
        &self,
        signal: &TradeSignal,
        state: &AccountState,
        mapping: &PositionMapping,
        close_ratio: Decimal,
    ) -> Decision {
        let fill = &signal.fill;
        let (leverage, _) = self.resolve_leverage(signal.position.as_ref(), state, fill);
        let margin_mode = if self.config.sync_margin_mode {
            mapping.margin_mode
        } else {
            self.configured_margin_mode()
        };

        let rationale = if close_ratio >= Decimal::ONE {
            format!("leader closed {} {} ({})", mapping.symbol, mapping.side, mapping.leader_position)
        } else {
            format!(
                "leader reduced {} {} by {}%",
                mapping.symbol,
                mapping.side,
                (close_ratio * Decimal::ONE_HUNDRED).round_dp(1)
            )
        };

        Decision {
            leverage,
            margin_mode,
            close_ratio,
            mapping_id: Some(mapping.id),
            rationale,
            ..self.new_decision(fill, DecisionAction::close(mapping.side), mapping.leader_position.clone())
        }
    }

    fn new_decision(&self, fill: &Fill, action: DecisionAction, leader_position: PositionKey) -> Decision {
        Decision {
            id: Uuid::new_v4(),
            follower_id: self.config.follower_id.clone(),
            leader_id: self.config.leader_id.clone(),
            fill_id: fill.id.clone(),
            symbol: fill.symbol.clone(),
            action,
            size_usd: Decimal::ZERO,
            leverage: self.engine_config.default_leverage,
            margin_mode: self.engine_config.default_margin_mode,
            close_ratio: Decimal::ZERO,
            leader_position,
            mapping_id: None,
            rationale: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Matched position first, then any leader position of the same symbol
    /// and side, then the configured default.
    fn resolve_leverage(&self, matched: Option<&Position>, state: &AccountState, fill: &Fill) -> (u32, MarginMode) {
        let leader = matched.or_else(|| state.positions_for(&fill.symbol, fill.position_side).into_iter().next());

        let leverage = if self.config.sync_leverage {
            leader
                .map(|p| p.leverage)
                .filter(|l| *l > 0)
                .unwrap_or(self.engine_config.default_leverage)
        } else {
            self.config.leverage.unwrap_or(self.engine_config.default_leverage)
        };

        let margin_mode = if self.config.sync_margin_mode {
            leader
                .map(|p| p.margin_mode)
                .unwrap_or(self.engine_config.default_margin_mode)
        } else {
            self.configured_margin_mode()
        };

        (leverage, margin_mode)
    }

    fn configured_margin_mode(&self) -> MarginMode {
        self.config
            .margin_mode
            .unwrap_or(self.engine_config.default_margin_mode)
    }

    /// Order value for an increase, or `None` when nothing can be sent.
    async fn size_copy(&self, signal: &TradeSignal, leverage: u32) -> Result<Option<Decimal>> {
        let info = self
            .executor
            .get_account_info()
            .await
            .context("Failed to read follower account")?;
        let balance = FollowerBalance::from_account_info(&info)?;

        let outcome = self.sizer.size(SizingInput {
            fill_notional: signal.fill.notional,
            leader_equity: signal.leader_equity,
            follower_equity: balance.total_equity,
            follower_available: balance.available_balance,
            leverage,
        });

        match outcome {
            SizeOutcome::Sized { size_usd, warnings } => {
                for warning in warnings {
                    self.record_warning(warning).await;
                }
                Ok(Some(size_usd))
            }
            SizeOutcome::Abandoned { reason, warning } => {
                info!(
                    follower = %self.config.follower_id,
                    fill = %signal.fill.id,
                    reason = %reason,
                    "Copy abandoned"
                );
                if let Some(warning) = warning {
                    self.record_warning(warning).await;
                }
                Ok(None)
            }
        }
    }

    async fn emit(&self, decision: Decision) {
        match self.decisions.try_send(decision) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                self.record_warning(Warning::new(
                    WarningKind::QueueFull,
                    format!("Decision queue full, dropped {} {}", dropped.action.as_str(), dropped.symbol),
                    dropped.size_usd,
                    dropped.size_usd,
                ))
                .await;
            }
            Err(TrySendError::Closed(dropped)) => {
                warn!(follower = %self.config.follower_id, decision = %dropped.id, "Decision queue closed");
            }
        }
    }

    async fn record_warning(&self, warning: Warning) {
        warn!(
            follower = %self.config.follower_id,
            kind = warning.kind.as_str(),
            signal_value = %warning.signal_value,
            copy_value = %warning.copy_value,
            "{}",
            warning.message
        );

        let capacity = self.engine_config.warning_log_capacity.max(1);
        let mut warnings = self.warnings.write().await;
        warnings.push_back(warning);
        while warnings.len() > capacity {
            warnings.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{FillAction, PositionSide, TradeSide};
    use crate::trading::DryRunExecutor;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    /// Leader source whose snapshot and fills are set by the test.
    struct ScriptedSource {
        venue: Venue,
        equity: Decimal,
        positions: std::sync::Mutex<Vec<Position>>,
        fills: std::sync::Mutex<Vec<Fill>>,
        unreachable: AtomicBool,
    }

    impl ScriptedSource {
        fn new(venue: Venue, positions: Vec<Position>) -> Arc<Self> {
            Arc::new(Self {
                venue,
                equity: dec!(100000),
                positions: std::sync::Mutex::new(positions),
                fills: std::sync::Mutex::new(Vec::new()),
                unreachable: AtomicBool::new(false),
            })
        }

        fn set_positions(&self, positions: Vec<Position>) {
            *self.positions.lock().unwrap() = positions;
        }

        fn set_fills(&self, fills: Vec<Fill>) {
            *self.fills.lock().unwrap() = fills;
        }

        fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LeaderDataSource for ScriptedSource {
        fn venue(&self) -> Venue {
            self.venue
        }

        // Inclusive lower bound, like the venues
        async fn get_fills(&self, _leader_id: &str, since: DateTime<Utc>) -> Result<Vec<Fill>, ProviderError> {
            let fills = self.fills.lock().unwrap();
            Ok(fills.iter().filter(|f| f.timestamp >= since).cloned().collect())
        }

        async fn get_account_state(&self, _leader_id: &str) -> Result<AccountState, ProviderError> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(ProviderError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            let positions = self.positions.lock().unwrap().clone();
            Ok(AccountState::new(self.equity, self.equity, positions))
        }
    }

    impl StreamingSource for ScriptedSource {
        // Connects once, then the subscription ends
        fn subscribe(
            &self,
            _leader_id: &str,
            events: mpsc::Sender<FeedEvent>,
            _cancel: CancellationToken,
        ) -> JoinHandle<()> {
            tokio::spawn(async move {
                let _ = events.send(FeedEvent::Connected).await;
            })
        }
    }

    fn position(symbol: &str, size: Decimal, leverage: u32) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            size,
            entry_price: dec!(2000),
            mark_price: dec!(2000),
            leverage,
            margin_mode: MarginMode::Cross,
            notional: size * dec!(2000),
            pos_id: None,
        }
    }

    fn okx_position(pos_id: &str, size: Decimal, margin_mode: MarginMode) -> Position {
        Position {
            margin_mode,
            pos_id: Some(pos_id.to_string()),
            ..position("BTCUSDT", size, 10)
        }
    }

    fn fill(id: &str, symbol: &str, action: FillAction, size: Decimal, notional: Decimal) -> Fill {
        Fill {
            id: id.to_string(),
            symbol: symbol.to_string(),
            side: if action.is_increase() { TradeSide::Buy } else { TradeSide::Sell },
            position_side: PositionSide::Long,
            action,
            price: dec!(2000),
            size,
            notional,
            timestamp: Utc::now(),
            realized_pnl: Decimal::ZERO,
        }
    }

    fn build_engine(
        config: CopyConfig,
        feed: LeaderFeed,
        store: Arc<MemoryStore>,
        engine_config: EngineConfig,
        executor: DryRunExecutor,
    ) -> (Arc<SignalEngine>, mpsc::Receiver<Decision>) {
        let (engine, rx) = SignalEngine::new(config, engine_config, feed, store, Arc::new(executor));
        (Arc::new(engine), rx)
    }

    fn engine_with(
        follower: &str,
        source: Arc<ScriptedSource>,
        store: Arc<MemoryStore>,
        engine_config: EngineConfig,
    ) -> (Arc<SignalEngine>, mpsc::Receiver<Decision>) {
        build_engine(
            CopyConfig::new(follower, source.venue, "leader"),
            LeaderFeed::Polling(source),
            store,
            engine_config,
            DryRunExecutor::new(dec!(1000)),
        )
    }

    #[tokio::test]
    async fn test_preexisting_position_never_followed() {
        let btc = position("BTCUSDT", dec!(1), 10);
        let source = ScriptedSource::new(Venue::Okx, vec![btc.clone()]);
        let store = Arc::new(MemoryStore::new());
        let (engine, mut rx) = engine_with("f1", source.clone(), store.clone(), EngineConfig::default());

        let root = CancellationToken::new();
        engine.start(&root).await.unwrap();

        let mapping = store.get_mapping("f1", &btc.key()).await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Ignored);

        source.set_positions(vec![position("BTCUSDT", dec!(1.5), 10)]);
        engine
            .submit_fill(fill("a1", "BTCUSDT", FillAction::Add, dec!(0.5), dec!(1000)))
            .await;

        source.set_positions(vec![position("BTCUSDT", dec!(0.5), 10)]);
        engine
            .submit_fill(fill("r1", "BTCUSDT", FillAction::Reduce, dec!(1), dec!(2000)))
            .await;

        source.set_positions(vec![]);
        engine
            .submit_fill(fill("c1", "BTCUSDT", FillAction::Close, dec!(0.5), dec!(1000)))
            .await;

        assert!(rx.try_recv().is_err());
        let mapping = store.get_mapping("f1", &btc.key()).await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Ignored);

        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_new_position_followed_through_close() {
        let source = ScriptedSource::new(Venue::Okx, vec![]);
        let store = Arc::new(MemoryStore::new());
        let (engine, mut rx) = engine_with("f1", source.clone(), store.clone(), EngineConfig::default());
        engine.start(&CancellationToken::new()).await.unwrap();

        let eth = position("ETHUSDT", dec!(5), 5);
        source.set_positions(vec![eth.clone()]);
        engine
            .submit_fill(fill("o1", "ETHUSDT", FillAction::Open, dec!(5), dec!(10000)))
            .await;

        let open = rx.try_recv().unwrap();
        assert_eq!(open.action, DecisionAction::OpenLong);
        assert_eq!(open.size_usd, dec!(100.00));
        assert_eq!(open.leverage, 5);
        assert_eq!(open.leader_position, eth.key());
        let mapping_id = open.mapping_id.unwrap();

        source.set_positions(vec![position("ETHUSDT", dec!(2.5), 5)]);
        engine
            .submit_fill(fill("r1", "ETHUSDT", FillAction::Reduce, dec!(2.5), dec!(5000)))
            .await;

        let reduce = rx.try_recv().unwrap();
        assert_eq!(reduce.action, DecisionAction::CloseLong);
        assert_eq!(reduce.close_ratio, dec!(0.5));
        assert_eq!(reduce.mapping_id, Some(mapping_id));

        source.set_positions(vec![]);
        engine
            .submit_fill(fill("c1", "ETHUSDT", FillAction::Close, dec!(2.5), dec!(5000)))
            .await;

        let close = rx.try_recv().unwrap();
        assert!(close.is_full_close());

        let mapping = store.get_mapping("f1", &eth.key()).await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Closed);
        assert_eq!(mapping.reduce_count, 1);
        assert_eq!(mapping.last_known_size, dec!(2.5));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_fill_yields_one_decision() {
        let source = ScriptedSource::new(Venue::Okx, vec![]);
        let store = Arc::new(MemoryStore::new());
        let (engine, mut rx) = engine_with("f1", source.clone(), store, EngineConfig::default());

        source.set_positions(vec![position("SOLUSDT", dec!(10), 10)]);
        let open = fill("dup", "SOLUSDT", FillAction::Open, dec!(10), dec!(20000));
        engine.submit_fill(open.clone()).await;
        engine.submit_fill(open).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_small_copy_boosted_with_warning() {
        let source = ScriptedSource::new(Venue::Okx, vec![]);
        let store = Arc::new(MemoryStore::new());
        let (engine, mut rx) = engine_with("f1", source.clone(), store, EngineConfig::default());

        source.set_positions(vec![position("SOLUSDT", dec!(1), 10)]);
        // 300 / 100000 * 1000 = 3.00
        engine
            .submit_fill(fill("s1", "SOLUSDT", FillAction::Open, dec!(1), dec!(300)))
            .await;

        assert_eq!(rx.try_recv().unwrap().size_usd, dec!(12));
        let warnings = engine.warnings().await;
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::SizeBoosted);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let source = ScriptedSource::new(Venue::Okx, vec![]);
        let store = Arc::new(MemoryStore::new());
        let engine_config = EngineConfig {
            decision_queue_capacity: 1,
            ..EngineConfig::default()
        };
        let (engine, mut rx) = engine_with("f1", source.clone(), store, engine_config);

        source.set_positions(vec![position("BTCUSDT", dec!(1), 10)]);
        engine
            .submit_fill(fill("q1", "BTCUSDT", FillAction::Open, dec!(1), dec!(10000)))
            .await;
        source.set_positions(vec![position("BTCUSDT", dec!(1), 10), position("ETHUSDT", dec!(1), 10)]);
        engine
            .submit_fill(fill("q2", "ETHUSDT", FillAction::Open, dec!(1), dec!(10000)))
            .await;

        assert_eq!(rx.try_recv().unwrap().fill_id, "q1");
        assert!(rx.try_recv().is_err());
        let warnings = engine.warnings().await;
        assert!(warnings.iter().any(|w| w.kind == WarningKind::QueueFull));
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_idempotent() {
        let source = ScriptedSource::new(Venue::Hyperliquid, vec![]);
        let (engine, _rx) = engine_with("f1", source, Arc::new(MemoryStore::new()), EngineConfig::default());
        let root = CancellationToken::new();

        engine.start(&root).await.unwrap();
        assert!(matches!(engine.start(&root).await, Err(EngineError::AlreadyRunning(_))));

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_followers_isolated() {
        let source = ScriptedSource::new(Venue::Okx, vec![]);
        let store = Arc::new(MemoryStore::new());
        let (first, mut first_rx) = engine_with("f1", source.clone(), store.clone(), EngineConfig::default());
        let (second, mut second_rx) = engine_with("f2", source.clone(), store.clone(), EngineConfig::default());

        source.set_positions(vec![position("BTCUSDT", dec!(1), 10)]);
        let open = fill("shared", "BTCUSDT", FillAction::Open, dec!(1), dec!(10000));
        tokio::join!(first.submit_fill(open.clone()), second.submit_fill(open));

        let a = first_rx.try_recv().unwrap();
        let b = second_rx.try_recv().unwrap();
        assert_eq!(a.follower_id, "f1");
        assert_eq!(b.follower_id, "f2");
        assert_ne!(a.mapping_id, b.mapping_id);
        assert_eq!(store.list_mappings("f1").await.unwrap().len(), 1);
        assert_eq!(store.list_mappings("f2").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_follows_each_fill_once() {
        let source = ScriptedSource::new(Venue::Okx, vec![]);
        let store = Arc::new(MemoryStore::new());
        // No dedup window: only the poll watermark keeps fills from repeating
        let engine_config = EngineConfig {
            fill_poll_secs: 1,
            dedup_ttl_secs: 0,
            ..EngineConfig::default()
        };
        let (engine, mut rx) = engine_with("f1", source.clone(), store, engine_config);
        engine.start(&CancellationToken::new()).await.unwrap();

        source.set_positions(vec![position("ETHUSDT", dec!(1), 10), position("BTCUSDT", dec!(1), 10)]);
        let early = fill("early", "ETHUSDT", FillAction::Add, dec!(1), dec!(10000));
        let late = Fill {
            timestamp: early.timestamp + chrono::Duration::seconds(1),
            ..fill("late", "BTCUSDT", FillAction::Add, dec!(1), dec!(10000))
        };
        // Venue order is newest first
        source.set_fills(vec![late, early]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        engine.stop().await;

        let mut followed = Vec::new();
        while let Ok(decision) = rx.try_recv() {
            followed.push(decision.fill_id);
        }
        assert_eq!(followed, vec!["early".to_string(), "late".to_string()]);
    }

    #[tokio::test]
    async fn test_add_on_ignored_after_reduce_not_attributed() {
        let a = okx_position("A", dec!(2), MarginMode::Cross);
        let source = ScriptedSource::new(Venue::Okx, vec![a.clone()]);
        let store = Arc::new(MemoryStore::new());
        let (engine, mut rx) = engine_with("f1", source.clone(), store.clone(), EngineConfig::default());
        engine.start(&CancellationToken::new()).await.unwrap();

        let b = okx_position("B", dec!(1), MarginMode::Isolated);
        source.set_positions(vec![a.clone(), b.clone()]);
        engine
            .submit_fill(fill("open-b", "BTCUSDT", FillAction::Add, dec!(1), dec!(2000)))
            .await;
        assert_eq!(rx.try_recv().unwrap().leader_position, b.key());

        source.set_positions(vec![okx_position("A", dec!(1), MarginMode::Cross), b.clone()]);
        engine
            .submit_fill(fill("reduce-a", "BTCUSDT", FillAction::Reduce, dec!(1), dec!(2000)))
            .await;

        source.set_positions(vec![okx_position("A", dec!(1.5), MarginMode::Cross), b.clone()]);
        engine
            .submit_fill(fill("add-a", "BTCUSDT", FillAction::Add, dec!(0.5), dec!(1000)))
            .await;

        assert!(rx.try_recv().is_err());
        let ignored = store.get_mapping("f1", &a.key()).await.unwrap().unwrap();
        assert_eq!(ignored.status, MappingStatus::Ignored);
        assert_eq!(ignored.last_known_size, dec!(1.5));
        let owned = store.get_mapping("f1", &b.key()).await.unwrap().unwrap();
        assert_eq!((owned.add_count, owned.last_known_size), (0, dec!(1)));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_zero_balance_open_registered_ignored() {
        let source = ScriptedSource::new(Venue::Okx, vec![]);
        let store = Arc::new(MemoryStore::new());
        let (engine, mut rx) = build_engine(
            CopyConfig::new("f1", Venue::Okx, "leader"),
            LeaderFeed::Polling(source.clone()),
            store.clone(),
            EngineConfig::default(),
            DryRunExecutor::new(Decimal::ZERO),
        );

        let sol = okx_position("S1", dec!(1), MarginMode::Cross);
        source.set_positions(vec![sol.clone()]);
        engine
            .submit_fill(fill("o1", "BTCUSDT", FillAction::Add, dec!(1), dec!(10000)))
            .await;

        assert!(rx.try_recv().is_err());
        assert!(engine
            .warnings()
            .await
            .iter()
            .any(|w| w.kind == WarningKind::ZeroBalance && w.executed));
        let mapping = store.get_mapping("f1", &sol.key()).await.unwrap().unwrap();
        assert_eq!(mapping.status, MappingStatus::Ignored);

        // Later growth on the abandoned position is never followed
        source.set_positions(vec![okx_position("S1", dec!(2), MarginMode::Cross)]);
        engine
            .submit_fill(fill("a1", "BTCUSDT", FillAction::Add, dec!(1), dec!(10000)))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leverage_resolution_order() {
        let source = ScriptedSource::new(Venue::Okx, vec![]);
        let (engine, _rx) = engine_with("f1", source, Arc::new(MemoryStore::new()), EngineConfig::default());
        let btc_fill = fill("x", "BTCUSDT", FillAction::Add, dec!(1), dec!(1000));

        let matched = okx_position("M", dec!(1), MarginMode::Isolated);
        let other = Position {
            leverage: 7,
            ..okx_position("O", dec!(2), MarginMode::Cross)
        };
        let state = AccountState::new(dec!(1000), dec!(1000), vec![other]);
        let empty = AccountState::new(dec!(1000), dec!(1000), vec![]);

        assert_eq!(
            engine.resolve_leverage(Some(&matched), &state, &btc_fill),
            (10, MarginMode::Isolated)
        );
        assert_eq!(engine.resolve_leverage(None, &state, &btc_fill), (7, MarginMode::Cross));
        assert_eq!(engine.resolve_leverage(None, &empty, &btc_fill), (10, MarginMode::Cross));

        let config = CopyConfig {
            sync_leverage: false,
            sync_margin_mode: false,
            leverage: Some(3),
            margin_mode: Some(MarginMode::Isolated),
            ..CopyConfig::new("f2", Venue::Okx, "leader")
        };
        let (fixed, _rx) = build_engine(
            config,
            LeaderFeed::Polling(ScriptedSource::new(Venue::Okx, vec![])),
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
            DryRunExecutor::new(dec!(1000)),
        );
        let leader = Position {
            leverage: 25,
            ..okx_position("M", dec!(1), MarginMode::Cross)
        };
        assert_eq!(
            fixed.resolve_leverage(Some(&leader), &state, &btc_fill),
            (3, MarginMode::Isolated)
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_uses_cached_snapshot() {
        let source = ScriptedSource::new(Venue::Okx, vec![]);
        let store = Arc::new(MemoryStore::new());
        let (engine, mut rx) = engine_with("f1", source.clone(), store.clone(), EngineConfig::default());

        let eth = okx_position("E1", dec!(5), MarginMode::Cross);
        source.set_positions(vec![eth.clone()]);
        engine.refresh_leader_state().await.unwrap();

        source.set_positions(vec![]);
        source.set_unreachable(true);
        engine
            .submit_fill(fill("o1", "BTCUSDT", FillAction::Add, dec!(5), dec!(10000)))
            .await;
        assert_eq!(rx.try_recv().unwrap().leader_position, eth.key());

        // Without any snapshot the fill cannot be classified
        let (cold, mut cold_rx) = engine_with("f2", source.clone(), store, EngineConfig::default());
        cold.submit_fill(fill("o2", "BTCUSDT", FillAction::Add, dec!(5), dec!(10000)))
            .await;
        assert!(cold_rx.try_recv().is_err());
        assert!(cold.leader_state().await.is_none());
    }

    #[tokio::test]
    async fn test_ended_stream_marks_engine_stopped() {
        let source = ScriptedSource::new(Venue::Hyperliquid, vec![]);
        let (engine, _rx) = build_engine(
            CopyConfig::new("f1", Venue::Hyperliquid, "0xleader"),
            LeaderFeed::Streaming(source),
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
            DryRunExecutor::new(dec!(1000)),
        );

        engine.start(&CancellationToken::new()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // A dead engine can be started again
        engine.start(&CancellationToken::new()).await.unwrap();
        engine.stop().await;
    }
}
