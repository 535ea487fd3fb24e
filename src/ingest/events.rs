use crate::db::models::{Fixture, RawGame};
use crate::error::StreamDecodeError;

use super::sse::SseFrame;

pub const ADD_GAME: &str = "addGame";
pub const REMOVE_GAME: &str = "removeGame";

/// Typed game event from the push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A game appeared or changed upstream
    Upsert(Fixture),
    /// A game was withdrawn upstream; tombstone it by id
    Remove(i64),
    /// Event type this engine does not act on
    Ignored(String),
}

impl StreamEvent {
    pub fn decode(frame: &SseFrame) -> Result<StreamEvent, StreamDecodeError> {
        match frame.event.as_str() {
            ADD_GAME => {
                let raw = decode_game(frame)?;
                let fixture = Fixture::try_from(raw).map_err(|source| StreamDecodeError::Invalid {
                    event: frame.event.clone(),
                    source,
                })?;
                Ok(StreamEvent::Upsert(fixture))
            }
            // Only the identity matters for a removal.
            REMOVE_GAME => Ok(StreamEvent::Remove(decode_game(frame)?.id)),
            other => Ok(StreamEvent::Ignored(other.to_string())),
        }
    }
}

fn decode_game(frame: &SseFrame) -> Result<RawGame, StreamDecodeError> {
    serde_json::from_str(&frame.data).map_err(|source| StreamDecodeError::Data {
        event: frame.event.clone(),
        source,
    })
}
