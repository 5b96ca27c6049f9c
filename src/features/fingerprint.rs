use chrono::NaiveDate;
use sha2::{Digest, Sha256};

fn digest(parts: &[&str]) -> String {
    hex::encode(Sha256::digest(parts.join("|").as_bytes()))
}

/// Canonical ticker form used in every identity hash
pub fn canonical_ticker(ticker: &str) -> String {
    ticker.trim().to_ascii_uppercase()
}

/// Identity of a feature window: sha256 of `TICKER|YYYY-MM-DD|feature_version`
pub fn window_fingerprint(ticker: &str, as_of: NaiveDate, feature_version: &str) -> String {
    let date = as_of.format("%Y-%m-%d").to_string();
    digest(&[&canonical_ticker(ticker), &date, feature_version.trim()])
}

/// Identity of a prediction, so re-running a prediction batch is a no-op
pub fn prediction_id(ticker: &str, as_of: NaiveDate, model_id: &str) -> String {
    let date = as_of.format("%Y-%m-%d").to_string();
    digest(&[&canonical_ticker(ticker), &date, model_id])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn test_fingerprint_is_pure() {
        let a = window_fingerprint("ABC", d(4), "v1-1234abcd");
        assert_eq!(a, window_fingerprint(" abc ", d(4), "v1-1234abcd"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_separates_inputs() {
        let base = window_fingerprint("ABC", d(4), "v1-1234abcd");
        assert_ne!(base, window_fingerprint("ABD", d(4), "v1-1234abcd"));
        assert_ne!(base, window_fingerprint("ABC", d(5), "v1-1234abcd"));
        assert_ne!(base, window_fingerprint("ABC", d(4), "v1-1234abce"));
    }

    #[test]
    fn test_prediction_id_depends_on_model() {
        assert_ne!(prediction_id("ABC", d(4), "m1"), prediction_id("ABC", d(4), "m2"));
        assert_eq!(prediction_id("ABC", d(4), "m1"), prediction_id("abc", d(4), "m1"));
    }
}
