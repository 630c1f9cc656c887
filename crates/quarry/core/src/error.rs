// Quarry
// Copyright (C) 2025 Quarry Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Error types shared by every engine subsystem

use std::io;
use std::time::Duration;

/// Error types surfaced by the storage engine.
///
/// Visibility retries are deliberately absent: an in-progress commit is
/// resolved inside the transaction index and never escapes to callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("volume {0:?} not found")]
    VolumeNotFound(String),

    #[error("tree {0:?} not found")]
    TreeNotFound(String),

    #[error("transaction not active: {0}")]
    TransactionNotActive(String),

    #[error("engine is closed")]
    Closed,
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// True for errors a caller may reasonably retry (transient reads).
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Io(_) | EngineError::Timeout(_, _))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::CorruptJournal("bad record length".to_string());
        assert_eq!(err.to_string(), "corrupt journal: bad record length");

        let err = EngineError::Timeout(Duration::from_secs(60), "commit flush".to_string());
        assert!(err.to_string().contains("60s"));
        assert!(err.to_string().contains("commit flush"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invariant_not_retryable() {
        let err = EngineError::InvariantViolation("floor regression".to_string());
        assert!(!err.is_retryable());
    }
}
