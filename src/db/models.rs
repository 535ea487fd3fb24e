use serde::Deserialize;

use crate::error::FixtureError;

/// One AFL fixture as tracked by the store.
///
/// `id` is the provider's game ID and the upsert key. Scores and the winner
/// are only authoritative once `completion` reaches 100.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixture {
    pub id: i64,
    pub round: i32,
    pub year: i32,
    pub home_team: String,
    pub away_team: String,
    home_score: Option<u32>,
    away_score: Option<u32>,
    pub winner: Option<String>,
    /// Percentage of the game played (0–100)
    completion: u8,
}

impl Fixture {
    pub fn new(id: i64, round: i32, year: i32, home_team: &str, away_team: &str) -> Self {
        Fixture {
            id,
            round,
            year,
            home_team: home_team.to_string(),
            away_team: away_team.to_string(),
            home_score: None,
            away_score: None,
            winner: None,
            completion: 0,
        }
    }

    pub fn home_score(&self) -> Option<u32> {
        self.home_score
    }

    pub fn away_score(&self) -> Option<u32> {
        self.away_score
    }

    pub fn completion(&self) -> u8 {
        self.completion
    }

    pub fn set_home_score(&mut self, score: Option<i64>) -> Result<(), FixtureError> {
        self.home_score = checked_score(score)?;
        Ok(())
    }

    pub fn set_away_score(&mut self, score: Option<i64>) -> Result<(), FixtureError> {
        self.away_score = checked_score(score)?;
        Ok(())
    }

    pub fn set_completion(&mut self, completion: i64) -> Result<(), FixtureError> {
        if !(0..=100).contains(&completion) {
            return Err(FixtureError::CompletionOutOfRange(completion));
        }
        self.completion = completion as u8;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.completion == 100
    }

    /// Winner, but only once the game is over.
    pub fn final_winner(&self) -> Option<&str> {
        if self.is_complete() {
            self.winner.as_deref()
        } else {
            None
        }
    }

    /// `(home, away)` once the game is over and both scores are known.
    pub fn final_score(&self) -> Option<(u32, u32)> {
        match (self.is_complete(), self.home_score, self.away_score) {
            (true, Some(h), Some(a)) => Some((h, a)),
            _ => None,
        }
    }
}

fn checked_score(score: Option<i64>) -> Result<Option<u32>, FixtureError> {
    match score {
        None => Ok(None),
        Some(s) if s < 0 => Err(FixtureError::NegativeScore(s)),
        Some(s) => u32::try_from(s)
            .map(Some)
            .map_err(|_| FixtureError::OutOfRange { field: "score", value: s }),
    }
}

/// A game object exactly as the provider publishes it, in both the bulk
/// `games` array and SSE `data:` payloads.
///
/// Every field except `id` may be missing or null.
#[derive(Debug, Clone, Deserialize)]
pub struct RawGame {
    pub id: i64,
    #[serde(default)]
    pub round: Option<i64>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub hteam: Option<String>,
    #[serde(default)]
    pub ateam: Option<String>,
    #[serde(default)]
    pub hscore: Option<i64>,
    #[serde(default)]
    pub ascore: Option<i64>,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub complete: Option<i64>,
}

impl TryFrom<RawGame> for Fixture {
    type Error = FixtureError;

    fn try_from(raw: RawGame) -> Result<Self, Self::Error> {
        let round = narrow("round", raw.round.unwrap_or(0))?;
        let year = narrow("year", raw.year.unwrap_or(0))?;
        let mut fixture = Fixture::new(
            raw.id,
            round,
            year,
            raw.hteam.as_deref().unwrap_or_default(),
            raw.ateam.as_deref().unwrap_or_default(),
        );
        fixture.set_home_score(raw.hscore)?;
        fixture.set_away_score(raw.ascore)?;
        fixture.set_completion(raw.complete.unwrap_or(0))?;
        fixture.winner = raw.winner.filter(|w| !w.is_empty());
        Ok(fixture)
    }
}

fn narrow(field: &'static str, value: i64) -> Result<i32, FixtureError> {
    i32::try_from(value).map_err(|_| FixtureError::OutOfRange { field, value })
}
