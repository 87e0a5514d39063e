use thiserror::Error;

pub type FuseResult<T> = Result<T, FuseError>;

/// Failures surfaced by the grid/fusion core.
///
/// Malformed numeric fields in streamed readings are deliberately absent from
/// this list: they are normalized to "no data" at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FuseError {
    /// Transport or parse failure on the one-time geometry fetch. Retryable.
    #[error("failed to load grid: {0}")]
    GeometryLoad(String),

    /// The geometry document violates the cell contract. Not retried.
    #[error("malformed geometry at feature {index}: {reason}")]
    MalformedGeometry { index: usize, reason: String },

    #[error("grid geometry is already loaded")]
    AlreadyLoaded,

    /// Rejected selection input; the previous selection is kept.
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
}

impl FuseError {
    pub fn malformed(index: usize, reason: impl Into<String>) -> Self {
        Self::MalformedGeometry {
            index,
            reason: reason.into(),
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::GeometryLoad(_))
    }
}
