use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Indicator columns a feature tensor can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    Return1d,
    SmaRatio,
    Volatility,
    VolumeZ,
    Rsi,
    BollingerPosition,
    AtrPct,
    EmaSpreadPct,
}

impl Indicator {
    pub fn name(&self) -> &'static str {
        match self {
            Indicator::Return1d => "return_1d",
            Indicator::SmaRatio => "sma_ratio",
            Indicator::Volatility => "volatility",
            Indicator::VolumeZ => "volume_z",
            Indicator::Rsi => "rsi",
            Indicator::BollingerPosition => "bb_position",
            Indicator::AtrPct => "atr_pct",
            Indicator::EmaSpreadPct => "ema_spread_pct",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorToggles {
    pub return_1d: bool,
    pub sma_ratio: bool,
    pub volatility: bool,
    pub volume_z: bool,
    pub rsi: bool,
    pub bollinger: bool,
    pub atr: bool,
    pub ema_spread: bool,
}

impl Default for IndicatorToggles {
    fn default() -> Self {
        Self {
            return_1d: true,
            sma_ratio: true,
            volatility: true,
            volume_z: true,
            rsi: true,
            bollinger: true,
            atr: true,
            ema_spread: true,
        }
    }
}

impl IndicatorToggles {
    /// Enabled indicators in fixed column order
    pub fn enabled(&self) -> Vec<Indicator> {
        [
            (self.return_1d, Indicator::Return1d),
            (self.sma_ratio, Indicator::SmaRatio),
            (self.volatility, Indicator::Volatility),
            (self.volume_z, Indicator::VolumeZ),
            (self.rsi, Indicator::Rsi),
            (self.bollinger, Indicator::BollingerPosition),
            (self.atr, Indicator::AtrPct),
            (self.ema_spread, Indicator::EmaSpreadPct),
        ]
        .into_iter()
        .filter_map(|(on, ind)| on.then_some(ind))
        .collect()
    }
}

/// Parameters that shape a feature tensor. Any change yields a new feature version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    pub label: String,
    pub window_length: usize,
    pub sma_fast: usize,
    pub sma_slow: usize,
    pub volatility_window: usize,
    pub volume_window: usize,
    pub rsi_period: usize,
    pub bollinger_period: usize,
    pub atr_period: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub indicators: IndicatorToggles,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            label: "v1".to_string(),
            window_length: 60,
            sma_fast: 5,
            sma_slow: 20,
            volatility_window: 10,
            volume_window: 20,
            rsi_period: 14,
            bollinger_period: 20,
            atr_period: 14,
            ema_fast: 9,
            ema_slow: 21,
            indicators: IndicatorToggles::default(),
        }
    }
}

impl FeatureParams {
    /// `<label>-<first 8 hex of sha256(canonical json)>`
    pub fn version(&self) -> String {
        // Field order is fixed by the struct, so the JSON is canonical
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
        format!("{}-{}", self.label, &digest[..8])
    }

    /// Extra leading observations indicators need before the first window row
    pub fn warmup(&self) -> usize {
        [
            self.sma_slow,
            self.sma_fast,
            self.volatility_window + 1,
            self.volume_window,
            self.rsi_period + 1,
            self.bollinger_period,
            self.atr_period + 1,
            self.ema_slow,
            2,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    pub fn required_history(&self) -> usize {
        self.window_length + self.warmup()
    }

    pub fn columns(&self) -> Vec<String> {
        self.indicators
            .enabled()
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.label.trim().is_empty() {
            errors.push("features.label must not be empty".to_string());
        }
        if self.window_length < 2 {
            errors.push("features.window_length must be >= 2".to_string());
        }
        if self.sma_fast == 0 || self.sma_fast >= self.sma_slow {
            errors.push("features: sma_fast must be > 0 and < sma_slow".to_string());
        }
        if self.ema_fast == 0 || self.ema_fast >= self.ema_slow {
            errors.push("features: ema_fast must be > 0 and < ema_slow".to_string());
        }
        if self.volatility_window < 2 || self.volume_window < 2 || self.bollinger_period < 2 {
            errors.push("features: rolling windows must be >= 2".to_string());
        }
        if self.rsi_period == 0 || self.atr_period == 0 {
            errors.push("features: rsi_period and atr_period must be > 0".to_string());
        }
        if self.indicators.enabled().is_empty() {
            errors.push("features: at least one indicator must be enabled".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_stable_and_labelled() {
        let params = FeatureParams::default();
        let v = params.version();
        assert_eq!(v, FeatureParams::default().version());
        assert!(v.starts_with("v1-"));
        assert_eq!(v.len(), "v1-".len() + 8);
    }

    #[test]
    fn test_any_parameter_change_changes_version() {
        let base = FeatureParams::default();
        let mut longer = base.clone();
        longer.window_length = 90;
        let mut fewer = base.clone();
        fewer.indicators.volume_z = false;
        assert_ne!(base.version(), longer.version());
        assert_ne!(base.version(), fewer.version());
        assert_ne!(longer.version(), fewer.version());
    }

    #[test]
    fn test_required_history_includes_warmup() {
        let params = FeatureParams::default();
        assert_eq!(params.warmup(), 21);
        assert_eq!(params.required_history(), 81);
        assert_eq!(params.columns().len(), 8);
    }

    #[test]
    fn test_validate_rejects_inverted_periods() {
        let mut params = FeatureParams::default();
        params.sma_fast = 30;
        params.indicators = IndicatorToggles {
            return_1d: false,
            sma_ratio: false,
            volatility: false,
            volume_z: false,
            rsi: false,
            bollinger: false,
            atr: false,
            ema_spread: false,
        };
        let errors = params.validate();
        assert_eq!(errors.len(), 2);
    }
}
