//! Pure total functions over bar sequences (spec.md §4.4, C4).
//!
//! Every function returns an array the same length as its input, with a
//! `NaN` prefix covering the warmup region. Determinism: for a given input
//! array and parameter, output is identical across calls — no hidden state,
//! no streaming accumulators retained between calls.

use crate::domain::candle::Candle;

fn nan_vec(len: usize) -> Vec<f64> {
    vec![f64::NAN; len]
}

/// Simple moving average over `values`, window `n`.
pub fn sma(values: &[f64], n: usize) -> Vec<f64> {
    let mut out = nan_vec(values.len());
    if n == 0 || values.len() < n {
        return out;
    }
    let mut window_sum: f64 = values[..n].iter().sum();
    out[n - 1] = window_sum / n as f64;
    for i in n..values.len() {
        window_sum += values[i] - values[i - n];
        out[i] = window_sum / n as f64;
    }
    out
}

/// Exponential moving average, seeded by the SMA of the first `n` values.
pub fn ema(values: &[f64], n: usize) -> Vec<f64> {
    let mut out = nan_vec(values.len());
    if n == 0 || values.len() < n {
        return out;
    }
    let alpha = 2.0 / (n as f64 + 1.0);
    let seed: f64 = values[..n].iter().sum::<f64>() / n as f64;
    out[n - 1] = seed;
    let mut prev = seed;
    for i in n..values.len() {
        let v = alpha * values[i] + (1.0 - alpha) * prev;
        out[i] = v;
        prev = v;
    }
    out
}

/// Wilder's RSI over `closes`, window `n`.
pub fn rsi(closes: &[f64], n: usize) -> Vec<f64> {
    let mut out = nan_vec(closes.len());
    if n == 0 || closes.len() <= n {
        return out;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=n {
        let change = closes[i] - closes[i - 1];
        if change >= 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let mut avg_gain = gains / n as f64;
    let mut avg_loss = losses / n as f64;
    out[n] = rsi_from_avgs(avg_gain, avg_loss);

    for i in (n + 1)..closes.len() {
        let change = closes[i] - closes[i - 1];
        let (gain, loss) = if change >= 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (n as f64 - 1.0) + gain) / n as f64;
        avg_loss = (avg_loss * (n as f64 - 1.0) + loss) / n as f64;
        out[i] = rsi_from_avgs(avg_gain, avg_loss);
    }
    out
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

fn true_range(prev_close: f64, candle: &Candle) -> f64 {
    (candle.h - candle.l)
        .max((candle.h - prev_close).abs())
        .max((candle.l - prev_close).abs())
}

/// Average True Range (Wilder smoothing), window `n`.
pub fn atr(candles: &[Candle], n: usize) -> Vec<f64> {
    let mut out = nan_vec(candles.len());
    if n == 0 || candles.len() <= n {
        return out;
    }
    let trs: Vec<f64> = (1..candles.len())
        .map(|i| true_range(candles[i - 1].c, &candles[i]))
        .collect();

    let mut avg: f64 = trs[..n].iter().sum::<f64>() / n as f64;
    out[n] = avg;
    for i in (n + 1)..candles.len() {
        let tr = trs[i - 1];
        avg = (avg * (n as f64 - 1.0) + tr) / n as f64;
        out[i] = avg;
    }
    out
}

pub struct AdxOutput {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

/// Average Directional Index with +DI/-DI, window `n`.
pub fn adx(candles: &[Candle], n: usize) -> AdxOutput {
    let len = candles.len();
    let mut plus_di = nan_vec(len);
    let mut minus_di = nan_vec(len);
    let mut adx_out = nan_vec(len);

    if n == 0 || len <= 2 * n {
        return AdxOutput {
            adx: adx_out,
            plus_di,
            minus_di,
        };
    }

    let mut tr_s = vec![0.0; len];
    let mut plus_dm_s = vec![0.0; len];
    let mut minus_dm_s = vec![0.0; len];
    for i in 1..len {
        tr_s[i] = true_range(candles[i - 1].c, &candles[i]);
        let up_move = candles[i].h - candles[i - 1].h;
        let down_move = candles[i - 1].l - candles[i].l;
        plus_dm_s[i] = if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 };
        minus_dm_s[i] = if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 };
    }

    let mut tr_avg: f64 = tr_s[1..=n].iter().sum();
    let mut plus_dm_avg: f64 = plus_dm_s[1..=n].iter().sum();
    let mut minus_dm_avg: f64 = minus_dm_s[1..=n].iter().sum();

    let mut dx_series = Vec::with_capacity(len);
    let record = |tr_avg: f64, plus_dm_avg: f64, minus_dm_avg: f64| -> (f64, f64, f64) {
        let pdi = if tr_avg > 0.0 { 100.0 * plus_dm_avg / tr_avg } else { 0.0 };
        let mdi = if tr_avg > 0.0 { 100.0 * minus_dm_avg / tr_avg } else { 0.0 };
        let dx = if pdi + mdi > 0.0 { 100.0 * (pdi - mdi).abs() / (pdi + mdi) } else { 0.0 };
        (pdi, mdi, dx)
    };

    let (pdi, mdi, dx) = record(tr_avg, plus_dm_avg, minus_dm_avg);
    plus_di[n] = pdi;
    minus_di[n] = mdi;
    dx_series.push((n, dx));

    for i in (n + 1)..len {
        tr_avg = tr_avg - tr_avg / n as f64 + tr_s[i];
        plus_dm_avg = plus_dm_avg - plus_dm_avg / n as f64 + plus_dm_s[i];
        minus_dm_avg = minus_dm_avg - minus_dm_avg / n as f64 + minus_dm_s[i];
        let (pdi, mdi, dx) = record(tr_avg, plus_dm_avg, minus_dm_avg);
        plus_di[i] = pdi;
        minus_di[i] = mdi;
        dx_series.push((i, dx));
    }

    if dx_series.len() >= n {
        let mut adx_avg: f64 = dx_series[..n].iter().map(|(_, dx)| dx).sum::<f64>() / n as f64;
        let (idx, _) = dx_series[n - 1];
        adx_out[idx] = adx_avg;
        for w in dx_series[n - 1..].windows(2) {
            let (_, dx) = w[1];
            adx_avg = (adx_avg * (n as f64 - 1.0) + dx) / n as f64;
            adx_out[w[1].0] = adx_avg;
        }
    }

    AdxOutput {
        adx: adx_out,
        plus_di,
        minus_di,
    }
}

pub struct DonchianOutput {
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Donchian channel: rolling max(high)/min(low) over window `n`.
pub fn donchian(candles: &[Candle], n: usize) -> DonchianOutput {
    let len = candles.len();
    let mut upper = nan_vec(len);
    let mut lower = nan_vec(len);
    if n == 0 || len < n {
        return DonchianOutput { upper, lower };
    }
    for i in (n - 1)..len {
        let window = &candles[i + 1 - n..=i];
        upper[i] = window.iter().fold(f64::MIN, |acc, c| acc.max(c.h));
        lower[i] = window.iter().fold(f64::MAX, |acc, c| acc.min(c.l));
    }
    DonchianOutput { upper, lower }
}

pub struct KeltnerOutput {
    pub upper: Vec<f64>,
    pub mid: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Keltner channel: EMA midline +/- `mult` * ATR.
pub fn keltner(candles: &[Candle], ema_n: usize, atr_n: usize, mult: f64) -> KeltnerOutput {
    let closes: Vec<f64> = candles.iter().map(|c| c.c).collect();
    let mid = ema(&closes, ema_n);
    let atr_vals = atr(candles, atr_n);
    let len = candles.len();
    let mut upper = nan_vec(len);
    let mut lower = nan_vec(len);
    for i in 0..len {
        if !mid[i].is_nan() && !atr_vals[i].is_nan() {
            upper[i] = mid[i] + mult * atr_vals[i];
            lower[i] = mid[i] - mult * atr_vals[i];
        }
    }
    KeltnerOutput { upper, mid, lower }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(t: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle { t, o, h, l, c, v: 1.0, n: 1 }
    }

    #[test]
    fn sma_has_nan_prefix_and_correct_values() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let out = sma(&values, 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert_eq!(out[2], 2.0);
        assert_eq!(out[3], 3.0);
        assert_eq!(out[4], 4.0);
    }

    #[test]
    fn ema_is_deterministic_across_calls() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let a = ema(&values, 3);
        let b = ema(&values, 3);
        assert_eq!(a, b);
        assert!(a[0].is_nan() && a[1].is_nan());
        assert!(!a[2].is_nan());
    }

    #[test]
    fn rsi_extreme_inputs_clamp_to_bounds() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let out = rsi(&rising, 14);
        let last = *out.last().unwrap();
        assert!((last - 100.0).abs() < 1e-6);
    }

    #[test]
    fn donchian_upper_lower_track_extremes() {
        let candles = vec![
            candle(0, 10.0, 12.0, 9.0, 11.0),
            candle(1, 11.0, 14.0, 10.0, 13.0),
            candle(2, 13.0, 13.5, 8.0, 9.0),
        ];
        let out = donchian(&candles, 3);
        assert!(out.upper[0].is_nan());
        assert!(out.upper[1].is_nan());
        assert_eq!(out.upper[2], 14.0);
        assert_eq!(out.lower[2], 8.0);
    }

    #[test]
    fn atr_warmup_prefix_matches_window() {
        let candles: Vec<Candle> = (0..10)
            .map(|i| candle(i, 10.0, 11.0, 9.0, 10.0))
            .collect();
        let out = atr(&candles, 5);
        for v in &out[..=5] {
            if *v == out[5] {
                continue;
            }
        }
        assert!(out[0].is_nan());
        assert!(!out[5].is_nan());
    }
}
