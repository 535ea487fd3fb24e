use tracing::{error, warn};

use crate::db::models::{Fixture, RawGame};
use crate::error::ParseError;

/// Result of decoding one provider payload.
///
/// An empty `fixtures` with `error` set means the payload failed, which is
/// not the same thing as a round without games.
#[derive(Debug, Default)]
pub struct ParsedGames {
    pub fixtures: Vec<Fixture>,
    /// Elements of `games` that were dropped as malformed
    pub skipped: usize,
    pub error: Option<ParseError>,
}

impl ParsedGames {
    /// Highest round among completed fixtures, if any finished at all.
    pub fn highest_completed_round(&self) -> Option<i32> {
        highest_completed_round(&self.fixtures)
    }
}

/// Decode a `{"games": [...]}` payload. Each element is decoded on its own,
/// so one bad game never costs the rest of the batch.
pub fn parse_games(body: &str) -> ParsedGames {
    let root: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            let err = ParseError::from(e);
            error!("Failed to parse games payload: {}", err);
            return ParsedGames {
                error: Some(err),
                ..Default::default()
            };
        }
    };

    let games = match root.get("games").and_then(|g| g.as_array()) {
        Some(a) => a,
        None => {
            error!("Games payload has no `games` array");
            return ParsedGames {
                error: Some(ParseError::MissingGames),
                ..Default::default()
            };
        }
    };

    let mut parsed = ParsedGames::default();
    for game in games {
        let decoded = serde_json::from_value::<RawGame>(game.clone())
            .map_err(|e| e.to_string())
            .and_then(|raw| Fixture::try_from(raw).map_err(|e| e.to_string()));
        match decoded {
            Ok(fixture) => parsed.fixtures.push(fixture),
            Err(reason) => {
                warn!("Skipping malformed game {}: {}", game, reason);
                parsed.skipped += 1;
            }
        }
    }
    // Nothing usable out of a non-empty batch is a broken payload, not an
    // empty round.
    if parsed.fixtures.is_empty() && parsed.skipped > 0 {
        error!("All {} games in payload are malformed", parsed.skipped);
        parsed.error = Some(ParseError::AllMalformed {
            skipped: parsed.skipped,
        });
    }
    parsed
}

pub fn highest_completed_round(fixtures: &[Fixture]) -> Option<i32> {
    fixtures
        .iter()
        .filter(|f| f.is_complete())
        .map(|f| f.round)
        .max()
}
