//! Session-level errors and their coarse classification.
//!
//! [`ErrorKind`] collapses every engine error into one of five buckets so
//! callers (HTTP layers, UIs) can pick a status code or retry policy without
//! matching on each variant.

use crate::provider::ProviderError;
use crate::store::StoreError;
use crate::turn::TurnError;
use crate::undo::UndoError;
use thiserror::Error;

/// Coarse category for surfacing errors outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself was malformed or empty.
    Validation,
    /// A referenced entity does not exist.
    NotFound,
    /// The request is valid but the current state refuses it.
    Conflict,
    /// The text generation backend failed or is unreachable.
    Upstream,
    /// Storage or serialization failure inside the engine.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors returned by [`GameSession`](crate::session::GameSession) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("card '{title}' is locked and cannot be edited")]
    CardLocked { title: String },
    #[error("no assistant reply to reroll")]
    NothingToReroll,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error(transparent)]
    Undo(#[from] UndoError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::CardLocked { .. } => ErrorKind::Conflict,
            SessionError::NothingToReroll => ErrorKind::Validation,
            SessionError::Store(e) => store_kind(e),
            SessionError::Turn(e) => turn_kind(e),
            SessionError::Undo(e) => undo_kind(e),
        }
    }
}

fn store_kind(err: &StoreError) -> ErrorKind {
    match err {
        StoreError::NotFound { .. } => ErrorKind::NotFound,
        StoreError::Card(_) | StoreError::EmptyGameName | StoreError::RatingOutOfRange(_) => {
            ErrorKind::Validation
        }
        StoreError::DuplicateMainHero | StoreError::MainHeroUndeletable => ErrorKind::Conflict,
        StoreError::Database(_) | StoreError::Corrupt(_) | StoreError::Snapshot(_) => {
            ErrorKind::Internal
        }
    }
}

fn turn_kind(err: &TurnError) -> ErrorKind {
    match err {
        TurnError::ProviderNotReady | TurnError::Provider(_) => ErrorKind::Upstream,
        TurnError::EmptyPrompt | TurnError::NothingToContinue => ErrorKind::Validation,
        TurnError::Store(e) => store_kind(e),
    }
}

fn undo_kind(err: &UndoError) -> ErrorKind {
    match err {
        UndoError::Conflict(_) | UndoError::UnsupportedAction(_) => ErrorKind::Conflict,
        UndoError::NotAssistantMessage => ErrorKind::Validation,
        UndoError::Store(e) => store_kind(e),
    }
}

impl From<ProviderError> for SessionError {
    fn from(err: ProviderError) -> Self {
        SessionError::Turn(TurnError::Provider(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_map_to_buckets() {
        let locked = SessionError::CardLocked {
            title: "The Vault".to_string(),
        };
        assert_eq!(locked.kind(), ErrorKind::Conflict);

        let missing = SessionError::Store(StoreError::not_found("game", "g1"));
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let empty = SessionError::Turn(TurnError::EmptyPrompt);
        assert_eq!(empty.kind(), ErrorKind::Validation);

        let offline = SessionError::Turn(TurnError::ProviderNotReady);
        assert_eq!(offline.kind(), ErrorKind::Upstream);

        let stale = SessionError::Undo(UndoError::Conflict("snapshot missing".to_string()));
        assert_eq!(stale.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::Upstream.as_str(), "upstream");
        assert_eq!(ErrorKind::Internal.as_str(), "internal");
    }
}
