use crate::types::{DiagnosticEntry, Direction};

/// Probability after guardrails, with the label and confidence derived from it
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedOutput {
    pub raw_probability: f64,
    pub probability: f64,
    pub label: Direction,
    pub confidence: f64,
    pub diversity: f64,
    pub clamped: bool,
    pub floor: f64,
    pub ceiling: f64,
}

impl BoundedOutput {
    pub fn diagnostic(&self) -> DiagnosticEntry {
        DiagnosticEntry::Bounds {
            raw_probability: self.raw_probability,
            bounded_probability: self.probability,
            floor: self.floor,
            ceiling: self.ceiling,
            clamped: self.clamped,
        }
    }
}

/// Clamp `raw` into `[floor, ceiling]` and label it against `up_threshold`.
/// A non-finite input is treated as a coin flip.
pub fn apply(raw: f64, diversity: f64, floor: f64, ceiling: f64, up_threshold: f64) -> BoundedOutput {
    let input = if raw.is_finite() { raw } else { 0.5 };
    let diversity = if diversity.is_finite() { diversity.clamp(0.0, 1.0) } else { 1.0 };
    let probability = input.clamp(floor, ceiling);
    let label = if probability >= up_threshold {
        Direction::Up
    } else {
        Direction::Down
    };
    let confidence = ((probability - 0.5).abs() * 2.0 * (1.0 - diversity)).clamp(0.0, 1.0);

    BoundedOutput {
        raw_probability: raw,
        probability,
        label,
        confidence,
        diversity,
        clamped: probability != raw,
        floor,
        ceiling,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps_to_ceiling() {
        let out = apply(0.99, 0.0, 0.05, 0.95, 0.5);
        assert_eq!(out.probability, 0.95);
        assert!(out.clamped);
        assert_eq!(out.label, Direction::Up);
        assert!((out.confidence - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_clamps_to_floor() {
        let out = apply(0.01, 0.0, 0.05, 0.95, 0.5);
        assert_eq!(out.probability, 0.05);
        assert_eq!(out.label, Direction::Down);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert_eq!(apply(0.55, 0.0, 0.05, 0.95, 0.55).label, Direction::Up);
        assert_eq!(apply(0.5499, 0.0, 0.05, 0.95, 0.55).label, Direction::Down);
    }

    #[test]
    fn test_diversity_discounts_confidence() {
        let calm = apply(0.8, 0.0, 0.05, 0.95, 0.5);
        let split = apply(0.8, 0.5, 0.05, 0.95, 0.5);
        assert!((calm.confidence - 0.6).abs() < 1e-12);
        assert!((split.confidence - 0.3).abs() < 1e-12);
        assert!(!split.clamped);
    }

    #[test]
    fn test_nan_becomes_neutral() {
        let out = apply(f64::NAN, 0.2, 0.05, 0.95, 0.5);
        assert_eq!(out.probability, 0.5);
        assert_eq!(out.confidence, 0.0);
        assert!(out.clamped);
        assert!(matches!(out.diagnostic(), DiagnosticEntry::Bounds { clamped: true, .. }));
    }
}
