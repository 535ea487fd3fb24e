use chrono::{Datelike, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::provider::{parse_games, FixtureProvider};
use crate::sink::FixtureSink;

/// The provider's coverage starts with the 1897 VFL season.
pub const FIRST_SEASON: i32 = 1897;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Never fall back to a season before this one
    pub min_season_year: i32,
    /// Maximum number of seasons to step back when a past season has no
    /// completed rounds
    pub max_year_fallback: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            min_season_year: FIRST_SEASON,
            max_year_fallback: 3,
        }
    }
}

/// What one bulk run managed to write. Per-round failures are counted here
/// rather than aborting the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub requested_year: i32,
    /// Season whose rounds were fetched, if any
    pub synced_year: Option<i32>,
    pub highest_completed_round: Option<i32>,
    pub rounds_succeeded: u32,
    pub rounds_failed: u32,
    pub fixtures_written: usize,
    /// Seasons stepped back from `requested_year`
    pub fallback_depth: u32,
}

impl SyncSummary {
    pub fn is_partial(&self) -> bool {
        self.rounds_failed > 0
    }
}

/// Fetches every completed round of a season and upserts it.
pub struct BulkSynchronizer {
    provider: Arc<dyn FixtureProvider>,
    sink: Arc<dyn FixtureSink>,
    options: SyncOptions,
}

impl BulkSynchronizer {
    pub fn new(
        provider: Arc<dyn FixtureProvider>,
        sink: Arc<dyn FixtureSink>,
        options: SyncOptions,
    ) -> Self {
        BulkSynchronizer {
            provider,
            sink,
            options,
        }
    }

    /// Sync rounds `0..=highest completed` of `year`, stepping back to earlier
    /// seasons when a past season has nothing completed.
    pub async fn sync_up_to_latest_completed_round(
        &self,
        year: i32,
    ) -> Result<SyncSummary, SyncError> {
        self.sync_as_of(year, Utc::now().year()).await
    }

    pub(crate) async fn sync_as_of(
        &self,
        year: i32,
        current_year: i32,
    ) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary {
            requested_year: year,
            ..Default::default()
        };
        let mut season = year;

        loop {
            match self.highest_completed_round(season).await? {
                Some(round) => {
                    summary.synced_year = Some(season);
                    summary.highest_completed_round = Some(round);
                    self.sync_rounds(season, round, &mut summary).await;
                    info!(
                        "[{}] Synced {} up to round {}: {} fixtures, {} rounds ok, {} failed",
                        self.provider.name(),
                        season,
                        round,
                        summary.fixtures_written,
                        summary.rounds_succeeded,
                        summary.rounds_failed
                    );
                    return Ok(summary);
                }
                None if season >= current_year => {
                    info!("No completed rounds yet in {}, nothing to sync", season);
                    return Ok(summary);
                }
                None if summary.fallback_depth >= self.options.max_year_fallback
                    || season - 1 < self.options.min_season_year =>
                {
                    warn!(
                        "No completed rounds in {} and fallback limit reached (depth {}, min season {}), giving up",
                        season, summary.fallback_depth, self.options.min_season_year
                    );
                    return Ok(summary);
                }
                None => {
                    info!("No completed rounds in {}, falling back to {}", season, season - 1);
                    season -= 1;
                    summary.fallback_depth += 1;
                }
            }
        }
    }

    async fn highest_completed_round(&self, year: i32) -> Result<Option<i32>, SyncError> {
        let body = self
            .provider
            .fetch_by_year(year)
            .await
            .map_err(|source| SyncError::Fetch { year, source })?;
        let parsed = parse_games(&body);
        if let Some(source) = parsed.error {
            return Err(SyncError::Parse { year, source });
        }
        if parsed.skipped > 0 {
            warn!("Season {}: skipped {} malformed games", year, parsed.skipped);
        }
        Ok(parsed.highest_completed_round())
    }

    async fn sync_rounds(&self, year: i32, highest: i32, summary: &mut SyncSummary) {
        for round in 0..=highest {
            let body = match self.provider.fetch_by_year_and_round(year, round).await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Skipping {} round {}: {}", year, round, e);
                    summary.rounds_failed += 1;
                    continue;
                }
            };

            let parsed = parse_games(&body);
            if let Some(e) = &parsed.error {
                warn!("Skipping {} round {}: unreadable payload: {}", year, round, e);
                summary.rounds_failed += 1;
                continue;
            }
            if parsed.fixtures.is_empty() {
                debug!("{} round {} has no games", year, round);
                summary.rounds_succeeded += 1;
                continue;
            }

            match self.sink.upsert_all(&parsed.fixtures).await {
                Ok(()) => {
                    summary.rounds_succeeded += 1;
                    summary.fixtures_written += parsed.fixtures.len();
                }
                Err(e) if e.is_connectivity() => {
                    warn!("Skipping {} round {}, store unavailable: {}", year, round, e);
                    summary.rounds_failed += 1;
                }
                Err(e) => {
                    warn!("Skipping {} round {}, store rejected batch: {}", year, round, e);
                    summary.rounds_failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ParseError, SinkError};
    use crate::testing::{game_json, games_body, RecordingSink, ScriptedProvider, SinkCall};

    fn setup(options: SyncOptions) -> (Arc<ScriptedProvider>, Arc<RecordingSink>, BulkSynchronizer) {
        let provider = Arc::new(ScriptedProvider::default());
        let sink = Arc::new(RecordingSink::default());
        let sync = BulkSynchronizer::new(
            Arc::clone(&provider) as Arc<dyn FixtureProvider>,
            Arc::clone(&sink) as Arc<dyn FixtureSink>,
            options,
        );
        (provider, sink, sync)
    }

    fn round_calls(provider: &ScriptedProvider) -> Vec<i32> {
        provider.calls().into_iter().filter_map(|(_, r)| r).collect()
    }

    #[tokio::test]
    async fn test_fetches_rounds_up_to_highest_completed() {
        let (provider, sink, sync) = setup(SyncOptions::default());
        provider.respond(
            2024,
            None,
            &games_body(&[
                game_json(1, 1, 2024, 100),
                game_json(2, 2, 2024, 100),
                game_json(3, 3, 2024, 40),
                game_json(4, 4, 2024, 0),
            ]),
        );
        provider.respond(2024, Some(1), &games_body(&[game_json(1, 1, 2024, 100)]));
        provider.respond(2024, Some(2), &games_body(&[game_json(2, 2, 2024, 100)]));

        let summary = sync.sync_as_of(2024, 2024).await.unwrap();

        assert_eq!(round_calls(&provider), vec![0, 1, 2]);
        assert_eq!(summary.highest_completed_round, Some(2));
        assert_eq!(summary.synced_year, Some(2024));
        assert_eq!(summary.rounds_succeeded, 3);
        assert_eq!(summary.fixtures_written, 2);
        assert_eq!(
            sink.calls(),
            vec![SinkCall::Upsert(vec![1]), SinkCall::Upsert(vec![2])]
        );
    }

    #[tokio::test]
    async fn test_past_year_without_completed_rounds_falls_back() {
        let (provider, _sink, sync) = setup(SyncOptions::default());
        provider.respond(2022, None, &games_body(&[game_json(1, 0, 2022, 0)]));
        provider.respond(2021, None, &games_body(&[game_json(9, 0, 2021, 100)]));

        let summary = sync.sync_as_of(2022, 2024).await.unwrap();

        assert_eq!(summary.synced_year, Some(2021));
        assert_eq!(summary.fallback_depth, 1);
        assert_eq!(
            provider.calls(),
            vec![(2022, None), (2021, None), (2021, Some(0))]
        );
    }

    #[tokio::test]
    async fn test_current_year_without_completed_rounds_stops() {
        let (provider, sink, sync) = setup(SyncOptions::default());
        provider.respond(2024, None, &games_body(&[game_json(1, 0, 2024, 50)]));

        let summary = sync.sync_as_of(2024, 2024).await.unwrap();

        assert_eq!(provider.calls(), vec![(2024, None)]);
        assert_eq!(summary.synced_year, None);
        assert!(sink.calls().is_empty());

        // A future season behaves the same way.
        let summary = sync.sync_as_of(2030, 2024).await.unwrap();
        assert_eq!(summary.fallback_depth, 0);
    }

    #[tokio::test]
    async fn test_fallback_is_bounded_by_depth() {
        let (provider, _sink, sync) = setup(SyncOptions {
            max_year_fallback: 2,
            ..Default::default()
        });
        // Every season answers with nothing completed.

        let summary = sync.sync_as_of(2020, 2024).await.unwrap();

        assert_eq!(
            provider.calls(),
            vec![(2020, None), (2019, None), (2018, None)]
        );
        assert_eq!(summary.fallback_depth, 2);
        assert_eq!(summary.synced_year, None);
    }

    #[tokio::test]
    async fn test_fallback_is_bounded_by_min_season() {
        let (provider, _sink, sync) = setup(SyncOptions {
            min_season_year: 1897,
            max_year_fallback: 100,
        });

        let summary = sync.sync_as_of(1898, 2024).await.unwrap();

        assert_eq!(provider.calls(), vec![(1898, None), (1897, None)]);
        assert_eq!(summary.fallback_depth, 1);
    }

    #[tokio::test]
    async fn test_failed_round_does_not_abort_the_rest() {
        let (provider, sink, sync) = setup(SyncOptions::default());
        provider.respond(2023, None, &games_body(&[game_json(3, 2, 2023, 100)]));
        provider.respond(2023, Some(0), &games_body(&[game_json(1, 0, 2023, 100)]));
        provider.fail(2023, Some(1), 502);
        provider.respond(2023, Some(2), &games_body(&[game_json(3, 2, 2023, 100)]));

        let summary = sync.sync_as_of(2023, 2024).await.unwrap();

        assert_eq!(round_calls(&provider), vec![0, 1, 2]);
        assert_eq!(summary.rounds_failed, 1);
        assert_eq!(summary.rounds_succeeded, 2);
        assert!(summary.is_partial());
        assert_eq!(sink.stored().len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_round_payload_counts_as_failure() {
        let (provider, sink, sync) = setup(SyncOptions::default());
        provider.respond(2023, None, &games_body(&[game_json(1, 1, 2023, 100)]));
        provider.respond(2023, Some(0), "<html>rate limited</html>");
        provider.respond(2023, Some(1), &games_body(&[game_json(1, 1, 2023, 100)]));

        let summary = sync.sync_as_of(2023, 2024).await.unwrap();

        assert_eq!(summary.rounds_failed, 1);
        assert_eq!(summary.rounds_succeeded, 1);
        assert_eq!(sink.calls(), vec![SinkCall::Upsert(vec![1])]);
    }

    #[tokio::test]
    async fn test_store_failure_skips_round() {
        let (provider, sink, sync) = setup(SyncOptions::default());
        provider.respond(2023, None, &games_body(&[game_json(2, 1, 2023, 100)]));
        provider.respond(2023, Some(0), &games_body(&[game_json(1, 0, 2023, 100)]));
        provider.respond(2023, Some(1), &games_body(&[game_json(2, 1, 2023, 100)]));
        sink.fail_next(SinkError::Connectivity("disk I/O error".into()));

        let summary = sync.sync_as_of(2023, 2024).await.unwrap();

        assert_eq!(summary.rounds_failed, 1);
        assert_eq!(summary.fixtures_written, 1);
        assert!(sink.stored().contains_key(&2));
    }

    #[tokio::test]
    async fn test_season_fetch_failure_is_an_error_not_a_fallback() {
        let (provider, _sink, sync) = setup(SyncOptions::default());
        provider.fail(2022, None, 500);

        let err = sync.sync_as_of(2022, 2024).await.unwrap_err();

        assert!(matches!(err, SyncError::Fetch { year: 2022, .. }));
        assert_eq!(provider.calls(), vec![(2022, None)]);
    }

    #[tokio::test]
    async fn test_season_parse_failure_is_an_error_not_a_fallback() {
        let (provider, _sink, sync) = setup(SyncOptions::default());
        provider.respond(2022, None, "not json");

        let err = sync.sync_as_of(2022, 2024).await.unwrap_err();

        assert!(matches!(err, SyncError::Parse { year: 2022, .. }));
        assert_eq!(provider.calls(), vec![(2022, None)]);
    }

    #[tokio::test]
    async fn test_season_of_only_malformed_games_is_an_error_not_a_fallback() {
        let (provider, _sink, sync) = setup(SyncOptions::default());
        provider.respond(
            2022,
            None,
            r#"{"games":[{"id":1,"round":5,"hscore":-1,"complete":100}]}"#,
        );

        let err = sync.sync_as_of(2022, 2024).await.unwrap_err();

        assert!(matches!(
            err,
            SyncError::Parse {
                year: 2022,
                source: ParseError::AllMalformed { skipped: 1 }
            }
        ));
        assert_eq!(provider.calls(), vec![(2022, None)]);
    }

    #[tokio::test]
    async fn test_round_of_only_malformed_games_counts_as_failure() {
        let (provider, sink, sync) = setup(SyncOptions::default());
        provider.respond(2021, None, &games_body(&[game_json(9, 1, 2021, 100)]));
        provider.respond(2021, Some(0), r#"{"games":[{"round":0}]}"#);
        provider.respond(2021, Some(1), &games_body(&[game_json(9, 1, 2021, 100)]));

        let summary = sync.sync_as_of(2021, 2024).await.unwrap();

        assert_eq!(summary.rounds_failed, 1);
        assert_eq!(summary.rounds_succeeded, 1);
        assert_eq!(summary.fixtures_written, 1);
        assert_eq!(sink.calls(), vec![SinkCall::Upsert(vec![9])]);
    }
}
