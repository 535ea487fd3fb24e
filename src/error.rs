use std::time::Duration;

use thiserror::Error;

/// Failure of a single bulk request against the provider.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("provider returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },
}

/// The payload as a whole could not be decoded.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no `games` array")]
    MissingGames,

    #[error("all {skipped} games in payload are malformed")]
    AllMalformed { skipped: usize },
}

/// Persistence failures, split so callers can decide between retrying and dropping.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("store unavailable: {0}")]
    Connectivity(String),

    #[error("record rejected by store: {0}")]
    Constraint(String),
}

impl SinkError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SinkError::Connectivity(_))
    }
}

impl From<rusqlite::Error> for SinkError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::Error as E;
        match &err {
            E::SqliteFailure(code, _) if code.code == rusqlite::ErrorCode::ConstraintViolation => {
                SinkError::Constraint(err.to_string())
            }
            E::ToSqlConversionFailure(_)
            | E::FromSqlConversionFailure(..)
            | E::IntegralValueOutOfRange(..)
            | E::InvalidColumnType(..) => SinkError::Constraint(err.to_string()),
            _ => SinkError::Connectivity(err.to_string()),
        }
    }
}

/// Validation failure on a fixture field.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FixtureError {
    #[error("score cannot be negative (got {0})")]
    NegativeScore(i64),

    #[error("completion must be within 0..=100 (got {0})")]
    CompletionOutOfRange(i64),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

/// A single SSE frame that could not be turned into an event.
#[derive(Debug, Error)]
pub enum StreamDecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("`{event}` data is not a game: {source}")]
    Data {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("`{event}` game rejected: {source}")]
    Invalid {
        event: String,
        #[source]
        source: FixtureError,
    },
}

/// Session-level failure of the push stream. Drives the reconnect state machine.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream closed by server")]
    Disconnected,

    #[error("no data received for {0:?}")]
    Idle(Duration),

    #[error("stream endpoint returned HTTP {0}")]
    Status(u16),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StreamError {
    /// Transient I/O-style failures are retried; everything else stops the subscription.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Transport(_) | StreamError::Disconnected | StreamError::Idle(_) => true,
            StreamError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            StreamError::Protocol(_) => false,
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => StreamError::Status(status.as_u16()),
            None => StreamError::Transport(err.to_string()),
        }
    }
}

/// The season payload itself could not be obtained, so no round was attempted.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("season {year}: {source}")]
    Fetch {
        year: i32,
        #[source]
        source: FetchError,
    },

    #[error("season {year}: {source}")]
    Parse {
        year: i32,
        #[source]
        source: ParseError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_classification() {
        assert!(StreamError::Transport("reset".into()).is_retryable());
        assert!(StreamError::Disconnected.is_retryable());
        assert!(StreamError::Idle(Duration::from_secs(30)).is_retryable());
        assert!(StreamError::Status(503).is_retryable());
        assert!(StreamError::Status(429).is_retryable());
        assert!(!StreamError::Status(404).is_retryable());
        assert!(!StreamError::Protocol("text/html".into()).is_retryable());
    }

    #[test]
    fn test_sink_error_from_constraint_violation() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER CHECK (v >= 0));")
            .unwrap();
        let err = conn.execute("INSERT INTO t (v) VALUES (-1)", []).unwrap_err();
        let sink_err = SinkError::from(err);
        assert!(matches!(sink_err, SinkError::Constraint(_)));
        assert!(!sink_err.is_connectivity());
    }

    #[test]
    fn test_invalid_utf8_frame_converts_to_decode_error() {
        let err = String::from_utf8(vec![b'd', 0xff]).unwrap_err();
        let decode_err = StreamDecodeError::from(err);
        assert!(matches!(decode_err, StreamDecodeError::Utf8(_)));
        assert!(decode_err.to_string().starts_with("frame is not valid UTF-8"));
    }
}
