use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::indicators::{self, PriceColumns};
use super::{canonical_ticker, window_fingerprint, FeatureParams, FeatureStore, FeatureTensor};
use crate::database::MarketDataSource;
use crate::error::{PipelineError, Result, RunWarning};
use crate::pipeline::partition::for_each_ticker;
use crate::types::{ContextDocument, ContextEntry, FeatureWindow, PhilosophyFlag, PriceBar};

/// Outcome of one feature build batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureBuildReport {
    pub feature_version: String,
    pub tickers_requested: usize,
    pub tickers_processed: usize,
    pub windows_created: usize,
    pub windows_existing: usize,
    pub window_ids: Vec<String>,
    pub warnings: Vec<RunWarning>,
    pub deadline_hit: bool,
}

/// Turns canonical price history into fixed-shape feature windows
pub struct FeatureBuilder {
    market: Arc<dyn MarketDataSource>,
    store: Arc<FeatureStore>,
    max_workers: usize,
}

impl FeatureBuilder {
    pub fn new(market: Arc<dyn MarketDataSource>, store: Arc<FeatureStore>, max_workers: usize) -> Self {
        Self {
            market,
            store,
            max_workers,
        }
    }

    pub async fn build(
        &self,
        tickers: Vec<String>,
        as_of: NaiveDate,
        params: &FeatureParams,
        config_version: i64,
        deadline: Instant,
    ) -> Result<FeatureBuildReport> {
        let feature_version = params.version();
        let tickers: Vec<String> = tickers.iter().map(|t| canonical_ticker(t)).collect();
        info!(
            "Building {} feature windows for {} tickers as of {}",
            feature_version,
            tickers.len(),
            as_of
        );

        let mut report = FeatureBuildReport {
            feature_version: feature_version.clone(),
            tickers_requested: tickers.len(),
            ..Default::default()
        };

        let version = feature_version.as_str();
        let outcome = for_each_ticker(tickers, self.max_workers, deadline, |ticker| async move {
            let result = self.build_one(&ticker, as_of, params, version, config_version).await;
            (ticker, result)
        })
        .await;

        report.deadline_hit = outcome.deadline_hit();
        let (built, warnings) = outcome.fold("features")?;
        for (_, (id, created)) in built {
            report.tickers_processed += 1;
            if created {
                report.windows_created += 1;
            } else {
                report.windows_existing += 1;
            }
            report.window_ids.push(id);
        }
        report.warnings = warnings;

        info!(
            "Feature build done: {} created, {} existing, {} warnings",
            report.windows_created,
            report.windows_existing,
            report.warnings.len()
        );
        Ok(report)
    }

    async fn build_one(
        &self,
        ticker: &str,
        as_of: NaiveDate,
        params: &FeatureParams,
        feature_version: &str,
        config_version: i64,
    ) -> Result<(String, bool)> {
        let bars = self.market.history(ticker, as_of, params.required_history()).await?;
        // The window is dated by its last session, so non-trading days map onto it
        let window_date = bars.last().map(|b| b.date).ok_or_else(|| PipelineError::DataInsufficiency {
            ticker: ticker.to_string(),
            needed: params.required_history(),
            available: 0,
        })?;
        if window_date < as_of {
            debug!("{} has no session on {}, window ends {}", ticker, as_of, window_date);
        }

        let id = window_fingerprint(ticker, window_date, feature_version);
        if self.store.get(&id).await?.is_some() {
            debug!("Window {} for {} already stored", id, ticker);
            return Ok((id, false));
        }

        let (mut context, tensor) = compute_window(ticker, &bars, params, config_version)?;
        if let Some(news) = self.market.latest_sentiment(ticker, window_date).await? {
            context.push(ContextEntry::NewsSentiment {
                as_of: news.as_of,
                article_count: news.article_count,
                avg_sentiment: news.avg_sentiment,
                buzz_score: news.buzz_score,
                volatility: news.volatility,
            });
        }

        let window = FeatureWindow {
            payload_ref: self.store.payload_path(&id).display().to_string(),
            id: id.clone(),
            ticker: ticker.to_string(),
            as_of: window_date,
            sequence_length: tensor.sequence_length(),
            feature_count: tensor.feature_count(),
            feature_version: feature_version.to_string(),
            context,
            created_at: Utc::now(),
        };
        let created = self.store.put(&window, &tensor).await?;
        Ok((id, created))
    }
}

/// Pure tensor and context computation over the trailing history of one ticker
pub fn compute_window(
    ticker: &str,
    bars: &[PriceBar],
    params: &FeatureParams,
    config_version: i64,
) -> Result<(ContextDocument, FeatureTensor)> {
    let needed = params.required_history();
    if bars.len() < needed {
        return Err(PipelineError::DataInsufficiency {
            ticker: ticker.to_string(),
            needed,
            available: bars.len(),
        });
    }

    let bars = &bars[bars.len() - needed..];
    let cols = PriceColumns::from_bars(bars);
    let enabled = params.indicators.enabled();
    let start = cols.len() - params.window_length;

    let mut rows = Vec::with_capacity(params.window_length);
    let mut dates = Vec::with_capacity(params.window_length);
    for end in start..cols.len() {
        rows.push(
            enabled
                .iter()
                .map(|ind| cols.value_at(*ind, end, params))
                .collect::<Vec<f64>>(),
        );
        dates.push(bars[end].date);
    }

    let tensor = FeatureTensor {
        columns: params.columns(),
        dates,
        rows,
    };

    let mut context = ContextDocument::default();
    for (j, ind) in enabled.iter().enumerate() {
        let column: Vec<f64> = tensor.rows.iter().map(|r| r[j]).collect();
        context.push(ContextEntry::IndicatorContribution {
            indicator: ind.name().to_string(),
            value: column.last().copied().unwrap_or(0.0),
            zscore: indicators::zscore_of_last(&column),
        });
    }

    let window_closes = &cols.closes[start..];
    let first_close = window_closes.first().copied().unwrap_or(0.0);
    let last_close = window_closes.last().copied().unwrap_or(0.0);
    let period_return_pct = if first_close != 0.0 {
        (last_close - first_close) / first_close * 100.0
    } else {
        0.0
    };
    context.push(ContextEntry::PriceSummary {
        first_close,
        last_close,
        period_return_pct,
        observations: window_closes.len(),
    });

    for (flag, rationale) in philosophy_flags(&cols, start, params, period_return_pct) {
        context.push(ContextEntry::Philosophy { flag, rationale });
    }
    context.push(ContextEntry::ConfigSource { config_version });

    Ok((context, tensor))
}

fn philosophy_flags(
    cols: &PriceColumns,
    start: usize,
    params: &FeatureParams,
    period_return_pct: f64,
) -> Vec<(PhilosophyFlag, String)> {
    let mut flags = Vec::new();
    let closes = &cols.closes;

    let sma_ratio = indicators::sma_ratio(closes, params.sma_fast, params.sma_slow).unwrap_or(0.0);
    let ema_spread = indicators::ema_spread_pct(closes, params.ema_fast, params.ema_slow).unwrap_or(0.0);
    if sma_ratio > 0.0 && ema_spread > 0.0 {
        flags.push((
            PhilosophyFlag::TrendAligned,
            format!("fast averages above slow (sma {:+.4}, ema {:+.2}%)", sma_ratio, ema_spread),
        ));
    }

    if period_return_pct < 0.0 && sma_ratio > 0.0 {
        flags.push((
            PhilosophyFlag::HoldUntilProfitable,
            format!("window return {:.2}% with short-term recovery", period_return_pct),
        ));
    }

    let vols: Vec<f64> = (start..cols.len())
        .filter_map(|end| indicators::return_volatility(&closes[..=end], params.volatility_window))
        .collect();
    if let Some(current) = vols.last() {
        let avg = vols.iter().sum::<f64>() / vols.len() as f64;
        if avg > 0.0 && *current > 1.5 * avg {
            flags.push((
                PhilosophyFlag::ElevatedVolatility,
                format!("volatility {:.4} vs window mean {:.4}", current, avg),
            ));
        }
    }

    if let Some(rsi) = indicators::rsi(closes, params.rsi_period) {
        if rsi < 30.0 {
            flags.push((PhilosophyFlag::Oversold, format!("rsi {:.1}", rsi)));
        } else if rsi > 70.0 {
            flags.push((PhilosophyFlag::Overbought, format!("rsi {:.1}", rsi)));
        }
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, MockMarketDataSource, SqliteMarketData};
    use crate::error::WarningKind;
    use crate::test_support::synthetic_bars;
    use crate::types::NewsSentiment;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_compute_window_is_deterministic() {
        let bars = synthetic_bars("ABC", 120, 0.0);
        let params = FeatureParams::default();
        let (ctx_a, a) = compute_window("ABC", &bars, &params, 0).unwrap();
        let (ctx_b, b) = compute_window("ABC", &bars, &params, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx_a, ctx_b);
        assert_eq!(a.sequence_length(), 60);
        assert_eq!(a.feature_count(), 8);
        assert_eq!(*a.dates.last().unwrap(), bars.last().unwrap().date);
    }

    #[test]
    fn test_compute_window_ignores_older_history() {
        let bars = synthetic_bars("ABC", 150, 0.0);
        let params = FeatureParams::default();
        let (_, full) = compute_window("ABC", &bars, &params, 0).unwrap();
        let (_, trimmed) = compute_window("ABC", &bars[150 - params.required_history()..], &params, 0).unwrap();
        assert_eq!(full, trimmed);
    }

    #[test]
    fn test_short_history_is_data_insufficiency() {
        let bars = synthetic_bars("ABC", 40, 0.0);
        let err = compute_window("ABC", &bars, &FeatureParams::default(), 0).unwrap_err();
        assert!(matches!(err, PipelineError::DataInsufficiency { available: 40, needed: 81, .. }));
    }

    #[tokio::test]
    async fn test_rebuild_is_noop() {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(SqliteMarketData::new(db.pool().clone()));
        let bars = synthetic_bars("ABC", 120, 0.0);
        market.insert_bars(&bars).await.unwrap();
        let store = Arc::new(FeatureStore::new(db.pool().clone(), dir.path()));
        let builder = FeatureBuilder::new(market, store.clone(), 2);
        let as_of = bars.last().unwrap().date;
        let params = FeatureParams::default();

        let first = builder.build(vec!["ABC".into()], as_of, &params, 0, far_deadline()).await.unwrap();
        assert_eq!(first.windows_created, 1);
        let second = builder.build(vec!["abc".into()], as_of, &params, 0, far_deadline()).await.unwrap();
        assert_eq!(second.windows_created, 0);
        assert_eq!(second.windows_existing, 1);
        assert_eq!(first.window_ids, second.window_ids);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partial_batch_reports_insufficient_ticker() {
        let mut market = MockMarketDataSource::new();
        market.expect_history().returning(|ticker, _, _| {
            let n = if ticker == "THIN" { 10 } else { 120 };
            Ok(synthetic_bars(ticker, n, 1.0))
        });
        market.expect_latest_sentiment().returning(|_, _| Ok(None));
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FeatureStore::new(db.pool().clone(), dir.path()));
        let builder = FeatureBuilder::new(Arc::new(market), store, 4);
        let as_of = synthetic_bars("ABC", 120, 1.0).last().unwrap().date;

        let report = builder
            .build(vec!["ABC".into(), "THIN".into()], as_of, &FeatureParams::default(), 0, far_deadline())
            .await
            .unwrap();
        assert_eq!(report.tickers_processed, 1);
        assert_eq!(report.windows_created, 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, WarningKind::DataInsufficiency);
        assert_eq!(report.warnings[0].ticker.as_deref(), Some("THIN"));
    }

    #[tokio::test]
    async fn test_parameter_change_creates_disjoint_window() {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(SqliteMarketData::new(db.pool().clone()));
        let bars = synthetic_bars("ABC", 120, 0.0);
        market.insert_bars(&bars).await.unwrap();
        let store = Arc::new(FeatureStore::new(db.pool().clone(), dir.path()));
        let builder = FeatureBuilder::new(market, store.clone(), 1);
        let as_of = bars.last().unwrap().date;

        let base = FeatureParams::default();
        let mut shorter = base.clone();
        shorter.window_length = 30;
        let a = builder.build(vec!["ABC".into()], as_of, &base, 0, far_deadline()).await.unwrap();
        let b = builder.build(vec!["ABC".into()], as_of, &shorter, 1, far_deadline()).await.unwrap();
        assert_ne!(a.window_ids, b.window_ids);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_window_is_dated_by_last_session() {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(SqliteMarketData::new(db.pool().clone()));
        let bars = synthetic_bars("ABC", 120, 0.0);
        market.insert_bars(&bars).await.unwrap();
        let store = Arc::new(FeatureStore::new(db.pool().clone(), dir.path()));
        let builder = FeatureBuilder::new(market, store.clone(), 1);
        let params = FeatureParams::default();
        let last_session = bars.last().unwrap().date;

        let on_session = builder.build(vec!["ABC".into()], last_session, &params, 0, far_deadline()).await.unwrap();
        // Requests past the last session (weekends, a stalled feed) resolve to the same window
        for days_later in [1, 2, 45] {
            let later = last_session + chrono::Duration::days(days_later);
            let report = builder.build(vec!["ABC".into()], later, &params, 0, far_deadline()).await.unwrap();
            assert_eq!(report.windows_created, 0);
            assert_eq!(report.windows_existing, 1);
            assert_eq!(report.window_ids, on_session.window_ids);
        }

        let window = store.get(&on_session.window_ids[0]).await.unwrap().unwrap();
        assert_eq!(window.as_of, last_session);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_history_is_not_redated() {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(SqliteMarketData::new(db.pool().clone()));
        let bars = synthetic_bars("ABC", 120, 0.0);
        market.insert_bars(&bars).await.unwrap();
        let store = Arc::new(FeatureStore::new(db.pool().clone(), dir.path()));
        let builder = FeatureBuilder::new(market, store.clone(), 1);
        let last_session = bars.last().unwrap().date;
        let requested = last_session + chrono::Duration::days(45);

        let report = builder
            .build(vec!["ABC".into()], requested, &FeatureParams::default(), 0, far_deadline())
            .await
            .unwrap();
        assert_eq!(report.windows_created, 1);
        let window = store.get(&report.window_ids[0]).await.unwrap().unwrap();
        assert_eq!(window.as_of, last_session);
        assert_ne!(window.as_of, requested);
    }

    #[tokio::test]
    async fn test_sentiment_recorded_in_context_when_available() {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(SqliteMarketData::new(db.pool().clone()));
        let abc = synthetic_bars("ABC", 120, 0.0);
        let xyz = synthetic_bars("XYZ", 120, 0.5);
        market.insert_bars(&abc).await.unwrap();
        market.insert_bars(&xyz).await.unwrap();
        let as_of = abc.last().unwrap().date;
        market
            .insert_sentiment(&[
                NewsSentiment {
                    ticker: "ABC".to_string(),
                    as_of: as_of - chrono::Duration::days(1),
                    article_count: 7,
                    avg_sentiment: 0.35,
                    buzz_score: Some(2.0),
                    volatility: Some(0.1),
                },
                // Published after the window date, must not leak in
                NewsSentiment {
                    ticker: "ABC".to_string(),
                    as_of: as_of + chrono::Duration::days(3),
                    article_count: 2,
                    avg_sentiment: -0.8,
                    buzz_score: None,
                    volatility: None,
                },
            ])
            .await
            .unwrap();
        let store = Arc::new(FeatureStore::new(db.pool().clone(), dir.path()));
        let builder = FeatureBuilder::new(market, store.clone(), 2);

        let report = builder
            .build(vec!["ABC".into(), "XYZ".into()], as_of, &FeatureParams::default(), 0, far_deadline())
            .await
            .unwrap();
        assert_eq!(report.windows_created, 2);

        let abc_window = store.latest_for("ABC", as_of, &FeatureParams::default().version()).await.unwrap().unwrap();
        assert_eq!(abc_window.context.sentiment(), Some(0.35));
        assert!(abc_window.context.entries.iter().any(|e| matches!(
            e,
            ContextEntry::NewsSentiment { article_count: 7, .. }
        )));

        let xyz_window = store.latest_for("XYZ", as_of, &FeatureParams::default().version()).await.unwrap().unwrap();
        assert_eq!(xyz_window.context.sentiment(), None);
        assert!(xyz_window.context.contribution("rsi").is_some());
    }
}
