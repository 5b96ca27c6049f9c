use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;

use super::{format_date, parse_date};
use crate::error::{PipelineError, Result};
use crate::types::{NewsSentiment, PriceBar};

/// Read access to canonical daily prices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Up to `limit` most recent bars dated on or before `as_of`, oldest first
    async fn history(&self, ticker: &str, as_of: NaiveDate, limit: usize) -> Result<Vec<PriceBar>>;

    /// Bars dated within `[start, end]`, oldest first
    async fn range(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>>;

    /// Up to `limit` bars dated strictly after `after`, oldest first
    async fn sessions_after(&self, ticker: &str, after: NaiveDate, limit: usize) -> Result<Vec<PriceBar>>;

    async fn tickers(&self) -> Result<Vec<String>>;

    /// Most recent news sentiment aggregate dated on or before `as_of`
    async fn latest_sentiment(&self, ticker: &str, as_of: NaiveDate) -> Result<Option<NewsSentiment>>;
}

pub struct SqliteMarketData {
    pool: SqlitePool,
}

impl SqliteMarketData {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert canonical bars; returns the number of rows written
    pub async fn insert_bars(&self, bars: &[PriceBar]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for bar in bars {
            let result = sqlx::query(
                r#"
                INSERT INTO market_prices (ticker, date, open, high, low, close, volume)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(ticker, date) DO UPDATE SET
                    open = excluded.open, high = excluded.high, low = excluded.low,
                    close = excluded.close, volume = excluded.volume
                "#,
            )
            .bind(bar.ticker.to_ascii_uppercase())
            .bind(format_date(bar.date))
            .bind(bar.open.to_string())
            .bind(bar.high.to_string())
            .bind(bar.low.to_string())
            .bind(bar.close.to_string())
            .bind(bar.volume.to_string())
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        debug!("Stored {} price bars", written);
        Ok(written)
    }

    /// Upsert daily sentiment aggregates; returns the number of rows written
    pub async fn insert_sentiment(&self, rows: &[NewsSentiment]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO news_sentiment (ticker, as_of, article_count, avg_sentiment, buzz_score, volatility)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(ticker, as_of) DO UPDATE SET
                    article_count = excluded.article_count, avg_sentiment = excluded.avg_sentiment,
                    buzz_score = excluded.buzz_score, volatility = excluded.volatility
                "#,
            )
            .bind(row.ticker.to_ascii_uppercase())
            .bind(format_date(row.as_of))
            .bind(row.article_count)
            .bind(row.avg_sentiment)
            .bind(row.buzz_score)
            .bind(row.volatility)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        debug!("Stored {} sentiment rows", written);
        Ok(written)
    }
}

#[async_trait]
impl MarketDataSource for SqliteMarketData {
    async fn history(&self, ticker: &str, as_of: NaiveDate, limit: usize) -> Result<Vec<PriceBar>> {
        let rows = sqlx::query(
            r#"
            SELECT ticker, date, open, high, low, close, volume FROM market_prices
            WHERE ticker = ? AND date <= ?
            ORDER BY date DESC LIMIT ?
            "#,
        )
        .bind(ticker)
        .bind(format_date(as_of))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut bars = rows.iter().map(row_to_bar).collect::<Result<Vec<_>>>()?;
        bars.reverse();
        Ok(bars)
    }

    async fn range(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
        let rows = sqlx::query(
            r#"
            SELECT ticker, date, open, high, low, close, volume FROM market_prices
            WHERE ticker = ? AND date >= ? AND date <= ?
            ORDER BY date ASC
            "#,
        )
        .bind(ticker)
        .bind(format_date(start))
        .bind(format_date(end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_bar).collect()
    }

    async fn sessions_after(&self, ticker: &str, after: NaiveDate, limit: usize) -> Result<Vec<PriceBar>> {
        let rows = sqlx::query(
            r#"
            SELECT ticker, date, open, high, low, close, volume FROM market_prices
            WHERE ticker = ? AND date > ?
            ORDER BY date ASC LIMIT ?
            "#,
        )
        .bind(ticker)
        .bind(format_date(after))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_bar).collect()
    }

    async fn tickers(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT ticker FROM market_prices ORDER BY ticker")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("ticker").map_err(PipelineError::from))
            .collect()
    }

    async fn latest_sentiment(&self, ticker: &str, as_of: NaiveDate) -> Result<Option<NewsSentiment>> {
        let row = sqlx::query(
            r#"
            SELECT ticker, as_of, article_count, avg_sentiment, buzz_score, volatility FROM news_sentiment
            WHERE ticker = ? AND as_of <= ?
            ORDER BY as_of DESC LIMIT 1
            "#,
        )
        .bind(ticker)
        .bind(format_date(as_of))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_sentiment).transpose()
    }
}

fn decimal_col(row: &SqliteRow, col: &str) -> Result<Decimal> {
    let raw: String = row.try_get(col)?;
    Decimal::from_str(&raw).map_err(|e| PipelineError::Corrupt(format!("{} {:?}: {}", col, raw, e)))
}

fn row_to_bar(row: &SqliteRow) -> Result<PriceBar> {
    let date: String = row.try_get("date")?;
    Ok(PriceBar {
        ticker: row.try_get("ticker")?,
        date: parse_date(&date)?,
        open: decimal_col(row, "open")?,
        high: decimal_col(row, "high")?,
        low: decimal_col(row, "low")?,
        close: decimal_col(row, "close")?,
        volume: decimal_col(row, "volume")?,
    })
}

fn row_to_sentiment(row: &SqliteRow) -> Result<NewsSentiment> {
    let as_of: String = row.try_get("as_of")?;
    Ok(NewsSentiment {
        ticker: row.try_get("ticker")?,
        as_of: parse_date(&as_of)?,
        article_count: row.try_get("article_count")?,
        avg_sentiment: row.try_get("avg_sentiment")?,
        buzz_score: row.try_get("buzz_score")?,
        volatility: row.try_get("volatility")?,
    })
}
