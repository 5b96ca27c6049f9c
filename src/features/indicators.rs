//! Trailing indicators over plain price columns.
//!
//! Every function looks at the tail of the slices it is given, so a row's value
//! is computed from `&column[..=row]` and never sees later observations.

use super::{FeatureParams, Indicator};
use crate::types::PriceBar;

/// Column-oriented view of a bar history
#[derive(Debug, Clone, Default)]
pub struct PriceColumns {
    pub closes: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl PriceColumns {
    pub fn from_bars(bars: &[PriceBar]) -> Self {
        Self {
            closes: bars.iter().map(PriceBar::close_f64).collect(),
            highs: bars.iter().map(PriceBar::high_f64).collect(),
            lows: bars.iter().map(PriceBar::low_f64).collect(),
            volumes: bars.iter().map(PriceBar::volume_f64).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    /// Value of `indicator` at row `end`, with a neutral fallback during warm-up
    pub fn value_at(&self, indicator: Indicator, end: usize, params: &FeatureParams) -> f64 {
        let closes = &self.closes[..=end];
        match indicator {
            Indicator::Return1d => return_1d(closes).unwrap_or(0.0),
            Indicator::SmaRatio => sma_ratio(closes, params.sma_fast, params.sma_slow).unwrap_or(0.0),
            Indicator::Volatility => return_volatility(closes, params.volatility_window).unwrap_or(0.0),
            Indicator::VolumeZ => volume_zscore(&self.volumes[..=end], params.volume_window).unwrap_or(0.0),
            Indicator::Rsi => rsi(closes, params.rsi_period).unwrap_or(50.0),
            Indicator::BollingerPosition => bb_position(closes, params.bollinger_period).unwrap_or(0.5),
            Indicator::AtrPct => {
                atr_pct(&self.highs[..=end], &self.lows[..=end], closes, params.atr_period).unwrap_or(0.0)
            }
            Indicator::EmaSpreadPct => ema_spread_pct(closes, params.ema_fast, params.ema_slow).unwrap_or(0.0),
        }
    }
}

fn tail(values: &[f64], n: usize) -> Option<&[f64]> {
    if n == 0 || values.len() < n { return None; }
    Some(&values[values.len() - n..])
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() { return 0.0; }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 { return 0.0; }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

pub fn return_1d(closes: &[f64]) -> Option<f64> {
    let recent = tail(closes, 2)?;
    if recent[0] == 0.0 { return None; }
    Some((recent[1] - recent[0]) / recent[0])
}

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    tail(values, period).map(mean)
}

/// Fast SMA over slow SMA, minus one
pub fn sma_ratio(closes: &[f64], fast: usize, slow: usize) -> Option<f64> {
    let fast_avg = sma(closes, fast)?;
    let slow_avg = sma(closes, slow)?;
    if slow_avg == 0.0 { return None; }
    Some(fast_avg / slow_avg - 1.0)
}

/// Sample std of the last `window` daily returns
pub fn return_volatility(closes: &[f64], window: usize) -> Option<f64> {
    let recent = tail(closes, window + 1)?;
    let returns: Vec<f64> = recent
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 { return None; }
    Some(std_dev(&returns))
}

pub fn volume_zscore(volumes: &[f64], period: usize) -> Option<f64> {
    let recent = tail(volumes, period)?;
    let sd = std_dev(recent);
    let current = *recent.last()?;
    if sd == 0.0 { return Some(0.0); }
    Some((current - mean(recent)) / sd)
}

pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    let recent = tail(closes, period + 1)?;
    let mut gains = 0.0;
    let mut losses = 0.0;
    for w in recent.windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 { gains += change; } else { losses += -change; }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 { return Some(100.0); }
    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Position of the last close inside 2-sigma Bollinger bands, 0 = lower, 1 = upper
pub fn bb_position(closes: &[f64], period: usize) -> Option<f64> {
    let recent = tail(closes, period)?;
    let m = mean(recent);
    let variance = recent.iter().map(|c| (c - m).powi(2)).sum::<f64>() / period as f64;
    let sd = variance.sqrt();
    let upper = m + 2.0 * sd;
    let lower = m - 2.0 * sd;
    let price = *recent.last()?;
    let band_width = upper - lower;
    if band_width == 0.0 { return Some(0.5); }
    Some(((price - lower) / band_width).clamp(0.0, 1.0))
}

/// Average high-low range as a percentage of the last close
pub fn atr_pct(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let h = tail(highs, period)?;
    let l = tail(lows, period)?;
    let price = *closes.last()?;
    if price == 0.0 { return None; }
    let avg_range = h.iter().zip(l).map(|(h, l)| h - l).sum::<f64>() / period as f64;
    Some(avg_range / price * 100.0)
}

pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period { return None; }
    let k = 2.0 / (period as f64 + 1.0);
    // Seed with the SMA of the first `period` values
    let mut current = mean(&values[..period]);
    for v in &values[period..] {
        current = v * k + current * (1.0 - k);
    }
    Some(current)
}

/// Fast EMA relative to slow EMA, in percent
pub fn ema_spread_pct(closes: &[f64], fast: usize, slow: usize) -> Option<f64> {
    let fast_ema = ema(closes, fast)?;
    let slow_ema = ema(closes, slow)?;
    if slow_ema == 0.0 { return None; }
    Some((fast_ema - slow_ema) / slow_ema * 100.0)
}

/// Z-score of the last value against the whole column
pub fn zscore_of_last(values: &[f64]) -> f64 {
    let sd = std_dev(values);
    match values.last() {
        Some(last) if sd > 0.0 => (last - mean(values)) / sd,
        _ => 0.0,
    }
}
