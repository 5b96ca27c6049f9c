use futures::stream::{self, StreamExt};
use std::future::Future;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{Result, RunWarning};

/// Results of a per-ticker fan-out, sorted by ticker
pub struct Partitioned<T> {
    pub completed: Vec<(String, Result<T>)>,
    /// Tickers that never finished because the deadline passed
    pub unfinished: Vec<String>,
}

impl<T> Partitioned<T> {
    pub fn deadline_hit(&self) -> bool {
        !self.unfinished.is_empty()
    }

    /// Splits outcomes into successes and warnings; the first fatal error wins
    pub fn fold(self, stage: &str) -> Result<(Vec<(String, T)>, Vec<RunWarning>)> {
        let mut ok = Vec::with_capacity(self.completed.len());
        let mut warnings = Vec::new();
        for (ticker, result) in self.completed {
            match result {
                Ok(value) => ok.push((ticker, value)),
                Err(err) => {
                    warn!("{} skipped {}: {}", stage, ticker, err);
                    warnings.push(RunWarning::from_error(Some(&ticker), err)?);
                }
            }
        }
        if !self.unfinished.is_empty() {
            warnings.push(RunWarning::deadline(stage, self.unfinished.len()));
        }
        Ok((ok, warnings))
    }
}

/// Runs `work` for each ticker with at most `max_workers` in flight, stopping at `deadline`
pub async fn for_each_ticker<T, F, Fut>(
    tickers: Vec<String>,
    max_workers: usize,
    deadline: Instant,
    mut work: F,
) -> Partitioned<T>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = (String, Result<T>)>,
{
    let mut pending: Vec<String> = tickers.clone();
    let mut results = stream::iter(tickers)
        .map(|ticker| work(ticker))
        .buffer_unordered(max_workers.max(1));

    let mut completed = Vec::with_capacity(pending.len());
    loop {
        match tokio::time::timeout_at(deadline, results.next()).await {
            Ok(Some((ticker, result))) => {
                if let Some(pos) = pending.iter().position(|t| *t == ticker) {
                    pending.swap_remove(pos);
                }
                completed.push((ticker, result));
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Deadline reached with {} tickers in flight or queued", pending.len());
                break;
            }
        }
    }

    completed.sort_by(|a, b| a.0.cmp(&b.0));
    pending.sort();
    Partitioned {
        completed,
        unfinished: pending,
    }
}
