//! Per-coin concurrent runner (spec.md §5): ties the candle streamer,
//! strategy, risk gate, signal handler, position book, and exchange event
//! stream together behind one mutex per coin.
//!
//! Resolves the position-book-vs-exchange-event mutex ordering left open by
//! spec.md §9: there is only one mutex. Both a strategy-driven decision (new
//! candle close) and an exchange-event reconciliation (fill update) acquire
//! the same `state` lock before touching the position book or placing
//! orders, so relative ordering between the two is simply whichever task
//! wins the lock acquisition — no second mutex, and therefore no separate
//! lock-ordering discipline to get wrong.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{MarginMode, RiskConfig};
use crate::domain::candle::{Candle, Interval};
use crate::domain::errors::RiskViolation;
use crate::domain::ports::{Dedup, ExchangeAdapter, OrderEventSource};
use crate::domain::repositories::SignalRepository;
use crate::domain::trading::{OrderTag, Signal, StrategyParam};
use crate::events::{EventKind, EventLog};
use crate::live::event_stream::EventReconciler;
use crate::live::position_book::PositionBook;
use crate::live::signal_handler::SignalHandler;
use crate::risk::{admit, GateContext};
use crate::strategy::{AnalysisContext, Strategy};

struct DailyCounters {
    epoch_day: i64,
    trades_today: u32,
    daily_pnl: f64,
}

impl DailyCounters {
    fn new() -> Self {
        Self { epoch_day: epoch_day(Utc::now().timestamp_millis()), trades_today: 0, daily_pnl: 0.0 }
    }

    fn roll(&mut self, now_ms: i64) {
        let day = epoch_day(now_ms);
        if day != self.epoch_day {
            self.epoch_day = day;
            self.trades_today = 0;
            self.daily_pnl = 0.0;
        }
    }
}

fn epoch_day(ms: i64) -> i64 {
    ms.div_euclid(86_400_000)
}

struct RunnerState {
    position_book: PositionBook,
    counters: DailyCounters,
    bars_since_exit: u32,
}

/// Drives one coin end to end: `C3 -> C5 -> C12 -> C13 -> exchange -> C15 ->
/// C14` (spec.md §1 data flow).
pub struct CoinRunner {
    coin: String,
    strategy: Mutex<Box<dyn Strategy>>,
    state: Mutex<RunnerState>,
    signal_handler: SignalHandler,
    reconciler: EventReconciler,
    exchange: Arc<dyn ExchangeAdapter>,
    dedup: Arc<dyn Dedup>,
    signal_repo: Arc<dyn SignalRepository>,
    risk_config: RiskConfig,
    requested_leverage: f64,
    margin_mode: MarginMode,
    auto_trading_enabled: std::sync::atomic::AtomicBool,
    size_decimals: u32,
    last_price: Mutex<Option<f64>>,
    last_tick_at: Mutex<Option<Instant>>,
    events: Arc<EventLog>,
}

impl CoinRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coin: String,
        strategy: Box<dyn Strategy>,
        signal_handler: SignalHandler,
        reconciler: EventReconciler,
        exchange: Arc<dyn ExchangeAdapter>,
        dedup: Arc<dyn Dedup>,
        signal_repo: Arc<dyn SignalRepository>,
        risk_config: RiskConfig,
        requested_leverage: f64,
        margin_mode: MarginMode,
        size_decimals: u32,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            coin,
            strategy: Mutex::new(strategy),
            state: Mutex::new(RunnerState {
                position_book: PositionBook::new(),
                counters: DailyCounters::new(),
                bars_since_exit: u32::MAX,
            }),
            signal_handler,
            reconciler,
            exchange,
            dedup,
            signal_repo,
            risk_config,
            requested_leverage,
            margin_mode,
            auto_trading_enabled: std::sync::atomic::AtomicBool::new(true),
            size_decimals,
            last_price: Mutex::new(None),
            last_tick_at: Mutex::new(None),
            events,
        }
    }

    pub fn set_auto_trading(&self, enabled: bool) {
        self.auto_trading_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Reacts to one fully-closed primary bar: updates the trailing stop or
    /// exit of an existing position, otherwise asks the strategy for a new
    /// entry and runs it through the guardrail gate (spec.md §1, §4.5-§4.13).
    pub async fn on_bar_close(&self, primary: &[Candle], higher: &HashMap<Interval, Vec<Candle>>) {
        if primary.is_empty() {
            return;
        }
        let index = primary.len() - 1;
        *self.last_price.lock().await = Some(primary[index].c);
        *self.last_tick_at.lock().await = Some(Instant::now());
        let mut state = self.state.lock().await;
        state.counters.roll(primary[index].t);

        let has_position = state.position_book.get(&self.coin).is_some();
        let ctx = AnalysisContext {
            candles: primary,
            index,
            higher_timeframes: higher,
            position_direction: state.position_book.get(&self.coin).map(|p| p.direction),
            position_entry_price: state.position_book.get(&self.coin).map(|p| p.entry_price),
            position_entry_bar_index: None,
            daily_pnl: state.counters.daily_pnl,
            trades_today: state.counters.trades_today,
            bars_since_exit: state.bars_since_exit,
            consecutive_losses: 0,
        };

        let mut strategy = self.strategy.lock().await;

        if has_position {
            if let Some(level) = strategy.get_exit_level(&ctx) {
                if let Some(new_stop) = state.position_book.update_trailing_stop(&self.coin, level, 1e-8) {
                    info!(coin = %self.coin, new_stop, "runner: trailing stop recalculated");
                }
            }
            if let Some(decision) = strategy.should_exit(&ctx) {
                if decision.exit {
                    self.close_position_defensively(&mut state, decision.comment).await;
                }
            }
            return;
        }

        state.bars_since_exit = state.bars_since_exit.saturating_add(1);

        let Some(signal) = strategy.on_candle(&ctx) else { return };
        drop(strategy);

        let params = HashMap::<String, StrategyParam>::new();
        let overrides = HashMap::new();
        let gate_ctx = GateContext {
            coin: &self.coin,
            strategy: "live",
            auto_trading_enabled: self.auto_trading_enabled.load(Ordering::SeqCst),
            trades_today: state.counters.trades_today,
            daily_pnl: state.counters.daily_pnl,
            open_positions: state.position_book.get_all().len(),
            position_open_for_coin: false,
            bars_since_exit: state.bars_since_exit,
            current_price: Some(primary[index].c),
            size_decimals: self.size_decimals,
            requested_leverage: self.requested_leverage,
            requested_overrides: &overrides,
            strategy_params: &params,
        };
        let alert_id = format!("{}-{}-{}", self.coin, primary[index].t, signal.direction);

        let admitted = admit(&self.dedup, &self.signal_repo, &alert_id, &gate_ctx, &signal, &self.risk_config).await;
        match admitted {
            Ok(size) => {
                state.counters.trades_today += 1;
                drop(state);
                self.events
                    .record(EventKind::SignalAdmitted { coin: self.coin.clone(), direction: signal.direction.to_string(), size })
                    .await;
                let isolated = matches!(self.margin_mode, MarginMode::Isolated);
                if let Err(e) = self
                    .signal_handler
                    .handle(&self.coin, &signal, size, self.requested_leverage, isolated, &mut self.state.lock().await.position_book)
                    .await
                {
                    error!(coin = %self.coin, error = %e, "runner: signal handler failed");
                } else {
                    self.events
                        .record(EventKind::PositionOpened {
                            coin: self.coin.clone(),
                            direction: signal.direction.to_string(),
                            entry_price: signal.entry_price.unwrap_or(primary[index].c),
                            size,
                        })
                        .await;
                }
            }
            Err(violation) => {
                warn!(coin = %self.coin, reason = %violation, "runner: signal rejected by guardrail gate");
                self.events.record(EventKind::SignalRejected { coin: self.coin.clone(), reason: violation.reason() }).await;
            }
        }
    }

    async fn close_position_defensively(&self, state: &mut RunnerState, comment: Option<String>) {
        let Some(position) = state.position_book.close(&self.coin) else { return };
        info!(coin = %self.coin, ?comment, "runner: strategy-driven exit");
        let closing_side = position.direction.opposite();
        if let Err(e) = self
            .exchange
            .place_market_order(&self.coin, closing_side, position.size, true, OrderTag::Sl)
            .await
        {
            error!(coin = %self.coin, error = %e, "runner: failed to flatten position on strategy exit");
        }
        state.bars_since_exit = 0;
        self.events
            .record(EventKind::PositionClosed { coin: self.coin.clone(), reason: comment.unwrap_or_else(|| "exit".to_string()) })
            .await;
    }

    /// Drains one order-update event through the reconciler under the same
    /// lock a candle-close decision would use.
    pub async fn on_order_event(&self, source: &mut dyn OrderEventSource) {
        match source.next_event().await {
            Ok(Some(event)) => {
                let mut state = self.state.lock().await;
                self.reconciler.apply(event, &mut state.position_book).await;
            }
            Ok(None) => {}
            Err(e) => {
                error!(coin = %self.coin, error = %e, "runner: order event source failed");
            }
        }
    }

    pub fn coin(&self) -> &str {
        &self.coin
    }

    pub fn is_auto_trading_enabled(&self) -> bool {
        self.auto_trading_enabled.load(Ordering::SeqCst)
    }

    /// True if no primary-interval bar has closed within `max_silence` (spec.md
    /// §7 "stale streamer data flips to `{status:"stale"}`"). `None` (never
    /// ticked) also counts as stale.
    pub async fn is_stale(&self, max_silence: std::time::Duration) -> bool {
        match *self.last_tick_at.lock().await {
            Some(at) => at.elapsed() > max_silence,
            None => true,
        }
    }

    /// Current position snapshot for the control API (spec.md §6 `GET
    /// /positions`).
    pub async fn position(&self) -> Option<crate::domain::trading::Position> {
        self.state.lock().await.position_book.get(&self.coin).cloned()
    }

    /// Last primary-interval close seen by this runner, for control-API
    /// endpoints that need a current price outside the guardrail gate
    /// (spec.md §6 `POST /quick-signal`).
    pub async fn last_price(&self) -> Option<f64> {
        *self.last_price.lock().await
    }

    /// Operator-initiated close (spec.md §6 `POST /close-position`), sharing
    /// the same defensive flatten path as a strategy-driven exit.
    pub async fn close_manually(&self) -> bool {
        let mut state = self.state.lock().await;
        let had_position = state.position_book.get(&self.coin).is_some();
        self.close_position_defensively(&mut state, Some("manual close".to_string())).await;
        had_position
    }

    /// Shared admission+execution path for externally-originated signals
    /// (spec.md §6 `POST /signal` and `POST /webhook`), mirroring the
    /// candle-driven path in [`on_bar_close`] without requiring a fresh bar
    /// close: `current_price` comes from the last primary-interval close
    /// seen by this runner, so a streamer that has never ticked rejects with
    /// `RiskViolation::NoMarketPrice` (spec.md §8 scenario 8).
    pub async fn submit_signal(&self, alert_id: &str, signal: &Signal) -> Result<f64, RiskViolation> {
        let current_price = *self.last_price.lock().await;
        let mut state = self.state.lock().await;
        state.counters.roll(Utc::now().timestamp_millis());

        let overrides = HashMap::new();
        let params = HashMap::<String, StrategyParam>::new();
        let gate_ctx = GateContext {
            coin: &self.coin,
            strategy: "live",
            auto_trading_enabled: self.auto_trading_enabled.load(Ordering::SeqCst),
            trades_today: state.counters.trades_today,
            daily_pnl: state.counters.daily_pnl,
            open_positions: state.position_book.get_all().len(),
            position_open_for_coin: state.position_book.get(&self.coin).is_some(),
            bars_since_exit: state.bars_since_exit,
            current_price,
            size_decimals: self.size_decimals,
            requested_leverage: self.requested_leverage,
            requested_overrides: &overrides,
            strategy_params: &params,
        };

        let size = match admit(&self.dedup, &self.signal_repo, alert_id, &gate_ctx, signal, &self.risk_config).await {
            Ok(size) => size,
            Err(violation) => {
                warn!(coin = %self.coin, alert_id, reason = %violation, "runner: submitted signal rejected by guardrail gate");
                self.events.record(EventKind::SignalRejected { coin: self.coin.clone(), reason: violation.reason() }).await;
                return Err(violation);
            }
        };
        state.counters.trades_today += 1;
        drop(state);
        self.events
            .record(EventKind::SignalAdmitted { coin: self.coin.clone(), direction: signal.direction.to_string(), size })
            .await;
        let isolated = matches!(self.margin_mode, MarginMode::Isolated);
        let mut state = self.state.lock().await;
        if let Err(e) = self
            .signal_handler
            .handle(&self.coin, signal, size, self.requested_leverage, isolated, &mut state.position_book)
            .await
        {
            error!(coin = %self.coin, alert_id, error = %e, "runner: signal handler failed for submitted signal");
        } else {
            self.events
                .record(EventKind::PositionOpened {
                    coin: self.coin.clone(),
                    direction: signal.direction.to_string(),
                    entry_price: signal.entry_price.unwrap_or(current_price.unwrap_or_default()),
                    size,
                })
                .await;
        }
        Ok(size)
    }
}
