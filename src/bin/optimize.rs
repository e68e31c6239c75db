//! Offline optimization loop entry point (spec.md §4.8-§4.11, C8-C11):
//! repeatedly backtests one strategy against a fixed candle file, asks an
//! external modifier process for the next parameter change, and keeps the
//! orchestrator's phase/checkpoint/history bookkeeping current between runs.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use perpd::backtest::{compute_metrics, run_backtest, BacktestConfig};
use perpd::config::{OptimizationConfig, RiskConfig};
use perpd::domain::candle::Candle;
use perpd::domain::optimization::{MetricsSnapshot, ParamChange, ParameterHistory};
use perpd::domain::ports::{ModifierOutcome, StrategyModifier};
use perpd::optimization::checkpoint::CheckpointStore;
use perpd::optimization::history::HistoryStore;
use perpd::optimization::modifier::ProcessModifier;
use perpd::optimization::phase::{Event, Phase, PhaseMachine};
use perpd::optimization::Orchestrator;
use perpd::scoring::{score, ScoreWeights};
use perpd::strategy::donchian_adx::{DonchianAdxParams, DonchianAdxStrategy};
use perpd::strategy::ema_pullback::{EmaPullbackParams, EmaPullbackStrategy};
use perpd::strategy::keltner_rsi2::{KeltnerRsi2Params, KeltnerRsi2Strategy};
use perpd::strategy::Strategy;

#[derive(Parser, Debug)]
#[command(name = "optimize", about = "Runs the refine/research/restructure optimization loop over a fixed candle file")]
struct Args {
    /// Strategy to optimize: donchian_adx, ema_pullback, or keltner_rsi2.
    #[arg(long)]
    strategy: String,

    /// JSON file holding a `Vec<Candle>` primary-timeframe series.
    #[arg(long)]
    candles: PathBuf,

    /// Directory holding checkpoint.json, history.json, and the strategy
    /// source the external modifier is allowed to rewrite.
    #[arg(long)]
    work_dir: PathBuf,

    /// Path to the strategy source file the modifier may rewrite in a
    /// restructure-phase iteration.
    #[arg(long)]
    strategy_source: PathBuf,

    /// External modifier executable. Omit to run refine-only smoke passes
    /// against the current parameter set with no proposed changes.
    #[arg(long)]
    modifier_cmd: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    max_iter: u32,

    #[arg(long, default_value_t = 10_000.0)]
    starting_equity: f64,
}

enum AnyParams {
    DonchianAdx(DonchianAdxParams),
    EmaPullback(EmaPullbackParams),
    KeltnerRsi2(KeltnerRsi2Params),
}

impl AnyParams {
    fn default_for(strategy: &str) -> Result<Self> {
        match strategy {
            "donchian_adx" => Ok(AnyParams::DonchianAdx(DonchianAdxParams::default())),
            "ema_pullback" => Ok(AnyParams::EmaPullback(EmaPullbackParams::default())),
            "keltner_rsi2" => Ok(AnyParams::KeltnerRsi2(KeltnerRsi2Params::default())),
            other => bail!("unknown strategy {other:?}; expected donchian_adx, ema_pullback, or keltner_rsi2"),
        }
    }

    fn build(&self) -> Box<dyn Strategy> {
        match self {
            AnyParams::DonchianAdx(p) => Box::new(DonchianAdxStrategy::new(*p)),
            AnyParams::EmaPullback(p) => Box::new(EmaPullbackStrategy::new(*p)),
            AnyParams::KeltnerRsi2(p) => Box::new(KeltnerRsi2Strategy::new(*p)),
        }
    }

    /// Applies every override, logging and skipping any field name the
    /// strategy doesn't recognize rather than failing the iteration.
    fn apply_overrides(&mut self, overrides: &HashMap<String, f64>) -> Option<ParamChange> {
        let before = current_overrides(self);
        let mut first_change = None;
        for (name, value) in overrides {
            let applied = match self {
                AnyParams::DonchianAdx(p) => p.apply_override(name, *value),
                AnyParams::EmaPullback(p) => p.apply_override(name, *value),
                AnyParams::KeltnerRsi2(p) => p.apply_override(name, *value),
            };
            if !applied {
                warn!(param = %name, "optimize: modifier proposed an unknown parameter name, ignoring");
                continue;
            }
            if first_change.is_none() {
                let from = before.get(name).copied().unwrap_or(0.0);
                if (from - value).abs() > f64::EPSILON {
                    first_change = Some(ParamChange { param: name.clone(), from, to: *value, scale: (value - from) / from.max(f64::EPSILON) });
                }
            }
        }
        first_change
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "perpd=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_phase(label: &str) -> Phase {
    match label {
        "research" => Phase::Research,
        "restructure" => Phase::Restructure,
        "done" => Phase::Done,
        _ => Phase::Refine,
    }
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Refine => "refine",
        Phase::Research => "research",
        Phase::Restructure => "restructure",
        Phase::Done => "done",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let candle_bytes = tokio::fs::read(&args.candles).await.context("reading candle file")?;
    let candles: Vec<Candle> = serde_json::from_slice(&candle_bytes).context("parsing candle file as a JSON array of candles")?;
    if candles.is_empty() {
        bail!("candle file {:?} contains no candles", args.candles);
    }

    let opt_config = OptimizationConfig { max_iter: args.max_iter, ..OptimizationConfig::default() };
    let risk = RiskConfig::default();
    let backtest_config = BacktestConfig {
        risk_per_trade_usd: risk.risk_per_trade_usd,
        max_trades_per_day: risk.max_trades_per_day,
        max_daily_loss_usd: risk.max_daily_loss_usd,
        cooldown_bars: risk.cooldown_bars,
        starting_equity: args.starting_equity,
    };

    let checkpoint_store = CheckpointStore::new(args.work_dir.join("checkpoints"));
    let history_store = HistoryStore::new(args.work_dir.join("history.json"));
    let history: ParameterHistory = history_store.load().await.context("loading parameter history")?;
    let initial_phase = parse_phase(&history.current_phase);

    let mut params = match checkpoint_store.load().await.context("loading checkpoint")? {
        Some(checkpoint) => {
            let mut p = AnyParams::default_for(&args.strategy)?;
            p.apply_overrides(&checkpoint.param_overrides);
            info!(iter = checkpoint.iter, "optimize: resumed from checkpoint");
            p
        }
        None => AnyParams::default_for(&args.strategy)?,
    };

    let modifier: Option<ProcessModifier> =
        args.modifier_cmd.map(|cmd| ProcessModifier::new(cmd, args.strategy_source.clone()));

    let mut orchestrator = Orchestrator::new(initial_phase, opt_config.clone(), checkpoint_store, history_store, history);

    let mut iter: u32 = 0;
    while !orchestrator.is_done() && iter < args.max_iter {
        iter += 1;
        orchestrator.phase_machine.handle(Event::IterStart);
        let phase = orchestrator.phase_machine.phase;

        let mut change = None;
        if let Some(modifier) = &modifier {
            let prompt_path = args.work_dir.join(format!("iter{iter}-prompt.json"));
            let prompt = serde_json::json!({
                "iter": iter,
                "phase": phase_label(phase),
                "strategy": args.strategy,
            });
            tokio::fs::write(&prompt_path, serde_json::to_vec_pretty(&prompt)?)
                .await
                .context("writing modifier prompt file")?;

            let timeout = match phase {
                Phase::Restructure => opt_config.restructure_timeout,
                _ => opt_config.refine_timeout,
            };
            match modifier.invoke(&prompt_path, timeout).await {
                Ok(ModifierOutcome::ParamOverrides(overrides)) => {
                    change = params.apply_overrides(&overrides);
                    orchestrator.phase_machine.handle(Event::ChangeApplied { is_restructure: false });
                }
                Ok(ModifierOutcome::SourceRewritten { .. }) => {
                    orchestrator.phase_machine.handle(Event::ChangeApplied { is_restructure: true });
                    warn!("optimize: modifier rewrote the strategy source; rebuild and relaunch this binary to pick it up");
                    break;
                }
                Err(e) => {
                    match orchestrator.handle_error(&e.to_string()) {
                        Ok(delay) => {
                            warn!(error = %e, delay_secs = delay.as_secs(), "optimize: recoverable modifier failure, backing off");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        Err(fatal) => {
                            bail!("optimize: unrecoverable modifier failure: {fatal}");
                        }
                    }
                }
            }
        } else {
            orchestrator.phase_machine.handle(Event::NoChange);
        }

        let mut strategy = params.build();
        let trades = run_backtest(strategy.as_mut(), &candles, &backtest_config);
        let metrics = compute_metrics(&trades, args.starting_equity);
        let param_count = strategy.params().values().filter(|p| p.optimizable).count() as u32;
        let components = score(&metrics, param_count, 0, &ScoreWeights::default());

        let snapshot = MetricsSnapshot { pnl: metrics.total_pnl, trades: metrics.num_trades, profit_factor: metrics.profit_factor };
        let param_overrides = current_overrides(&params);
        let source_bytes = tokio::fs::read(&args.strategy_source).await.unwrap_or_default();

        let verdict = orchestrator
            .record_iteration(
                iter,
                change,
                source_bytes,
                param_overrides,
                snapshot,
                components.weighted,
                opt_config.min_trades,
                &args.strategy_source,
            )
            .await
            .context("recording iteration")?;

        info!(iter, phase = phase_label(phase), score = components.weighted, trades = metrics.num_trades, ?verdict, "optimize: iteration complete");

        orchestrator.phase_machine.handle(Event::Verdict(verdict));
        orchestrator.phase_machine.handle(Event::Escalate);
        orchestrator.phase_machine.handle(Event::PhaseTimeout);
    }

    info!(iter, done = orchestrator.is_done(), "optimize: loop finished");
    Ok(())
}

fn current_overrides(params: &AnyParams) -> HashMap<String, f64> {
    match params {
        AnyParams::DonchianAdx(p) => HashMap::from([
            ("donchian_fast".to_string(), p.donchian_fast as f64),
            ("donchian_slow".to_string(), p.donchian_slow as f64),
            ("adx_period".to_string(), p.adx_period as f64),
            ("adx_max_for_entry".to_string(), p.adx_max_for_entry),
            ("atr_period".to_string(), p.atr_period as f64),
            ("atr_stop_mult".to_string(), p.atr_stop_mult),
            ("atr_trail_mult".to_string(), p.atr_trail_mult),
            ("daily_ema_period".to_string(), p.daily_ema_period as f64),
            ("timeout_bars".to_string(), p.timeout_bars as f64),
        ]),
        AnyParams::EmaPullback(p) => HashMap::from([
            ("regime_ema_period".to_string(), p.regime_ema_period as f64),
            ("primary_ema_period".to_string(), p.primary_ema_period as f64),
            ("atr_period".to_string(), p.atr_period as f64),
            ("atr_stop_mult".to_string(), p.atr_stop_mult),
            ("reward_risk_ratio".to_string(), p.reward_risk_ratio),
            ("pullback_tolerance_pct".to_string(), p.pullback_tolerance_pct),
            ("timeout_bars".to_string(), p.timeout_bars as f64),
        ]),
        AnyParams::KeltnerRsi2(p) => HashMap::from([
            ("ema_period".to_string(), p.ema_period as f64),
            ("atr_period".to_string(), p.atr_period as f64),
            ("atr_mult".to_string(), p.atr_mult),
            ("rsi_period".to_string(), p.rsi_period as f64),
            ("rsi_oversold".to_string(), p.rsi_oversold),
            ("rsi_overbought".to_string(), p.rsi_overbought),
            ("volume_sma_period".to_string(), p.volume_sma_period as f64),
            ("short_volume_min_ratio".to_string(), p.short_volume_min_ratio),
            ("timeout_bars".to_string(), p.timeout_bars as f64),
        ]),
    }
}
