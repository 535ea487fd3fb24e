pub mod parser;
pub mod squiggle;

pub use parser::parse_games;
pub use squiggle::SquiggleClient;

use async_trait::async_trait;

use crate::error::FetchError;

/// Bulk fixture queries against the upstream provider.
///
/// Implementations return the raw response body and never retry; retry
/// policy belongs to the caller.
#[async_trait]
pub trait FixtureProvider: Send + Sync {
    /// Every game of a season.
    async fn fetch_by_year(&self, year: i32) -> Result<String, FetchError>;

    /// The games of a single round.
    async fn fetch_by_year_and_round(&self, year: i32, round: i32) -> Result<String, FetchError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
