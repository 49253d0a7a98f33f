//! Upstream data sources: model probabilities, market prices and final scores.
//!
//! The core never fetches anything itself; these traits are the seam where a
//! model service or odds feed plugs in. `JsonFileFeed` covers the file-based
//! workflow used by the CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::models::{GameResult, Opportunity, Selection};
use crate::sizing::kelly::american_to_decimal;

/// One model estimate for one side of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityEstimate {
    pub event_id: String,
    pub selection: Selection,
    #[serde(default)]
    pub entity: String,
    pub probability: f64,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// One quoted American price for one side of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub event_id: String,
    pub selection: Selection,
    pub price: i32,
    #[serde(default)]
    pub book: Option<String>,
}

#[async_trait]
pub trait ProbabilitySource: Send + Sync {
    async fn fetch_estimates(&self) -> Result<Vec<ProbabilityEstimate>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

#[async_trait]
pub trait OddsSource: Send + Sync {
    async fn fetch_quotes(&self) -> Result<Vec<PriceQuote>>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait ResultsSource: Send + Sync {
    async fn fetch_results(&self) -> Result<Vec<GameResult>>;

    fn name(&self) -> &str;
}

/// Reads a JSON array of records from a file on every fetch.
#[derive(Debug, Clone)]
pub struct JsonFileFeed {
    path: PathBuf,
    name: String,
}

impl JsonFileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("json:{}", path.display());
        Self { path, name }
    }

    async fn read<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let records: Vec<T> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        debug!("Loaded {} record(s) from {}", records.len(), self.path.display());
        Ok(records)
    }
}

#[async_trait]
impl ProbabilitySource for JsonFileFeed {
    async fn fetch_estimates(&self) -> Result<Vec<ProbabilityEstimate>> {
        self.read().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl OddsSource for JsonFileFeed {
    async fn fetch_quotes(&self) -> Result<Vec<PriceQuote>> {
        self.read().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ResultsSource for JsonFileFeed {
    async fn fetch_results(&self) -> Result<Vec<GameResult>> {
        self.read().await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Join estimates with quotes on `(event_id, selection)`.
///
/// When several books quote the same side the best price wins. Estimates with
/// no quote are skipped. Any zero or malformed price fails the whole call.
pub fn build_opportunities(
    estimates: &[ProbabilityEstimate],
    quotes: &[PriceQuote],
) -> crate::Result<Vec<Opportunity>> {
    for quote in quotes {
        american_to_decimal(quote.price)?;
    }

    let mut opportunities = Vec::with_capacity(estimates.len());
    for est in estimates {
        let mut best: Option<(i32, f64)> = None;
        for quote in quotes
            .iter()
            .filter(|q| q.event_id == est.event_id && q.selection == est.selection)
        {
            let decimal = american_to_decimal(quote.price)?;
            if best.map_or(true, |(_, d)| decimal > d) {
                best = Some((quote.price, decimal));
            }
        }
        let Some((price, _)) = best else {
            debug!("No quote for {} {}", est.event_id, est.selection);
            continue;
        };
        opportunities.push(Opportunity::new(
            est.event_id.clone(),
            est.selection.clone(),
            est.entity.clone(),
            est.probability,
            price,
            est.confidence,
        )?);
    }
    Ok(opportunities)
}

/// Fetch estimates and quotes concurrently and join them into a slate.
pub async fn load_slate(
    probabilities: &dyn ProbabilitySource,
    odds: &dyn OddsSource,
) -> Result<Vec<Opportunity>> {
    let (estimates, quotes) =
        futures_util::try_join!(probabilities.fetch_estimates(), odds.fetch_quotes())?;
    let slate = build_opportunities(&estimates, &quotes)?;
    info!(
        "Loaded slate of {} opportunit(ies) from {} estimate(s) [{}] and {} quote(s) [{}]",
        slate.len(),
        estimates.len(),
        probabilities.name(),
        quotes.len(),
        odds.name()
    );
    Ok(slate)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFeed {
        estimates: Vec<ProbabilityEstimate>,
        quotes: Vec<PriceQuote>,
    }

    #[async_trait]
    impl ProbabilitySource for StaticFeed {
        async fn fetch_estimates(&self) -> Result<Vec<ProbabilityEstimate>> {
            Ok(self.estimates.clone())
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    #[async_trait]
    impl OddsSource for StaticFeed {
        async fn fetch_quotes(&self) -> Result<Vec<PriceQuote>> {
            Ok(self.quotes.clone())
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    fn estimate(event: &str, selection: Selection, p: f64) -> ProbabilityEstimate {
        ProbabilityEstimate {
            event_id: event.into(),
            selection,
            entity: "Sox".into(),
            probability: p,
            confidence: Some(0.8),
        }
    }

    fn quote(event: &str, selection: Selection, price: i32) -> PriceQuote {
        PriceQuote {
            event_id: event.into(),
            selection,
            price,
            book: None,
        }
    }

    #[test]
    fn joins_on_event_and_selection_with_best_price() {
        let estimates = vec![
            estimate("g1", Selection::Home, 0.55),
            estimate("g1", Selection::Over { line: 8.5 }, 0.5),
            estimate("g2", Selection::Home, 0.6),
        ];
        let quotes = vec![
            quote("g1", Selection::Home, -120),
            quote("g1", Selection::Home, 105),
            quote("g1", Selection::Home, -110),
            quote("g1", Selection::Over { line: 9.5 }, 100),
            quote("g1", Selection::Over { line: 8.5 }, -105),
        ];
        let opps = build_opportunities(&estimates, &quotes).unwrap();
        assert_eq!(opps.len(), 2);
        assert_eq!(opps[0].price, 105);
        assert_eq!(opps[0].confidence, Some(0.8));
        assert_eq!(opps[1].id, "g1:over 8.5");
        assert_eq!(opps[1].price, -105);
    }

    #[test]
    fn zero_price_fails_fast() {
        let estimates = vec![estimate("g1", Selection::Home, 0.55)];
        let quotes = vec![quote("g9", Selection::Away, 0)];
        assert_eq!(
            build_opportunities(&estimates, &quotes).unwrap_err(),
            crate::Error::InvalidPrice { price: 0 }
        );
    }

    #[tokio::test]
    async fn load_slate_from_static_sources() {
        let feed = StaticFeed {
            estimates: vec![estimate("g1", Selection::Away, 0.45)],
            quotes: vec![quote("g1", Selection::Away, 130)],
        };
        let slate = load_slate(&feed, &feed).await.unwrap();
        assert_eq!(slate.len(), 1);
        assert!((slate[0].edge - 0.035).abs() < 1e-12);
    }

    #[tokio::test]
    async fn json_file_feed_reads_records() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("stakewise-feed-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            r#"[{"event_id":"g1","home_score":5,"away_score":3},
                {"event_id":"g2","home_score":2,"away_score":2,"total_runs":4}]"#,
        )
        .await
        .unwrap();

        let feed = JsonFileFeed::new(&path);
        let results = feed.fetch_results().await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].total_runs, Some(4));
        assert!(ResultsSource::name(&feed).starts_with("json:"));

        tokio::fs::remove_file(&path).await.unwrap();
        assert!(feed.fetch_results().await.is_err());
    }

    #[tokio::test]
    async fn json_estimates_accept_tagged_selections() {
        let path = std::env::temp_dir().join(format!("stakewise-est-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            r#"[{"event_id":"g1","selection":{"kind":"under","line":7.5},"probability":0.52}]"#,
        )
        .await
        .unwrap();
        let estimates = JsonFileFeed::new(&path).fetch_estimates().await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();
        assert_eq!(estimates[0].selection, Selection::Under { line: 7.5 });
        assert_eq!(estimates[0].confidence, None);
        assert_eq!(estimates[0].entity, "");
    }
}
