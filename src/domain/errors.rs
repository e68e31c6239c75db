//! Error kinds surfaced to callers (spec.md §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CandleError {
    #[error("unsupported interval: {interval}")]
    UnsupportedInterval { interval: String },

    #[error("unsupported candle source: {source}")]
    UnsupportedSource { source: String },

    #[error("upstream candle API unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    #[error("transient candle fetch failure: {reason}")]
    Transient { reason: String },
}

#[derive(Debug, Error)]
pub enum RiskViolation {
    #[error("duplicate alert id: {alert_id}")]
    Duplicate { alert_id: String },

    #[error("invalid signal: {reason}")]
    InvalidSignal { reason: String },

    #[error("auto-trading disabled for {coin}/{strategy}")]
    AutoTradingDisabled { coin: String, strategy: String },

    #[error("daily trade cap reached: {count} >= {max}")]
    DailyTradeCap { count: u32, max: u32 },

    #[error("daily loss limit breached: {loss_usd:.2} <= -{max_usd:.2}")]
    DailyLossLimit { loss_usd: f64, max_usd: f64 },

    #[error("open position cap reached: {count} >= {max}")]
    OpenPositionCap { count: usize, max: usize },

    #[error("position already open for {coin}")]
    PositionAlreadyOpen { coin: String },

    #[error("position size rounds to zero")]
    ZeroSize,

    #[error("notional {notional:.2} exceeds cap {max:.2}")]
    NotionalCap { notional: f64, max: f64 },

    #[error("leverage {leverage:.2} exceeds cap {max:.2}")]
    LeverageCap { leverage: f64, max: f64 },

    #[error("cooldown active: {bars_since_exit} < {cooldown_bars} bars since exit")]
    Cooldown {
        bars_since_exit: u32,
        cooldown_bars: u32,
    },

    #[error("no market price available")]
    NoMarketPrice,

    #[error("protected field changed: {field}")]
    ProtectedFieldChanged { field: String },

    #[error("parameter {name} out of bounds: {value} not in [{min}, {max}]")]
    ParamOutOfBounds {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

impl RiskViolation {
    /// The human-readable reason persisted on `StoredSignal.riskCheckReason`.
    pub fn reason(&self) -> String {
        match self {
            RiskViolation::Duplicate { .. } => "Duplicate".to_string(),
            RiskViolation::NoMarketPrice => "No market price".to_string(),
            RiskViolation::DailyTradeCap { .. } => "global_daily_limit".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("compile error: {message}")]
    CompileError { message: String },

    #[error("timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("transient error: {message}")]
    Transient { message: String },

    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl OrchestratorError {
    /// Classifies a raw error message into one of the recoverable kinds, or
    /// `Fatal` (spec.md §4.11). Recoverable kinds use regex-free substring
    /// matching for determinism across locales.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("compile") || lower.contains("syntax error") || lower.contains("e0") {
            OrchestratorError::CompileError {
                message: message.to_string(),
            }
        } else if lower.contains("timed out") || lower.contains("timeout") {
            OrchestratorError::Timeout { seconds: 0 }
        } else if lower.contains("connection") || lower.contains("dns") || lower.contains("network") {
            OrchestratorError::Network {
                message: message.to_string(),
            }
        } else if lower.contains("temporarily") || lower.contains("transient") || lower.contains("retry") {
            OrchestratorError::Transient {
                message: message.to_string(),
            }
        } else {
            OrchestratorError::Fatal {
                message: message.to_string(),
            }
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, OrchestratorError::Fatal { .. })
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: String },

    #[error(transparent)]
    Rejected(#[from] RiskViolation),

    #[error("upstream exchange call failed: {reason}")]
    ExchangeFailed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_reason_matches_api_contract() {
        let v = RiskViolation::Duplicate {
            alert_id: "abc".into(),
        };
        assert_eq!(v.reason(), "Duplicate");
    }

    #[test]
    fn daily_cap_reason_matches_webhook_contract() {
        let v = RiskViolation::DailyTradeCap { count: 10, max: 10 };
        assert_eq!(v.reason(), "global_daily_limit");
    }

    #[test]
    fn classify_recognizes_compile_errors() {
        let e = OrchestratorError::classify("error[E0308]: mismatched types");
        assert!(matches!(e, OrchestratorError::CompileError { .. }));
        assert!(e.is_recoverable());
    }

    #[test]
    fn classify_falls_back_to_fatal() {
        let e = OrchestratorError::classify("panic: index out of bounds");
        assert!(matches!(e, OrchestratorError::Fatal { .. }));
        assert!(!e.is_recoverable());
    }
}
