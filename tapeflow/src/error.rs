//! All errors generated in `tapeflow`.
//!
//! Only the series pipeline has error paths. The counter, chunk cache, and
//! bar folding consume internally-produced, well-typed data and defensively
//! ignore malformed input instead of raising.

use crate::series::{OutputKind, SerieId, VisualType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-series failures surfaced on the validation channel.
///
/// Compile-class variants leave a series unbound until its formula is
/// corrected; [`SeriesError::NonNumeric`] additionally unbinds a running
/// series so it stops failing repeatedly.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum SeriesError {
    #[error("formula parse failed: {0}")]
    Parse(String),

    #[error("unknown reference '{0}'")]
    UnknownReference(String),

    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("window argument of '{0}' must be a number or an options reference")]
    WindowArgument(String),

    #[error("output kind '{output}' cannot drive visual type '{visual}'")]
    OutputMismatch {
        output: OutputKind,
        visual: VisualType,
    },

    #[error("series '{0}' is part of a reference cycle")]
    CyclicReference(String),

    #[error("series produced a non-numeric value at bucket {time}")]
    NonNumeric { time: i64 },

    #[error("unknown visual type '{0}'")]
    UnknownVisual(String),
}

impl SeriesError {
    /// True for failures raised while compiling a formula, as opposed to
    /// runtime evaluation faults.
    pub fn is_compile(&self) -> bool {
        !matches!(self, SeriesError::NonNumeric { .. })
    }
}

/// Validation error event for the UI collaborator: which series failed and a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SeriesFault {
    pub serie: SerieId,
    pub error: SeriesError,
}

impl SeriesFault {
    pub fn new(serie: SerieId, error: SeriesError) -> Self {
        Self { serie, error }
    }

    /// The displayable message for the error channel.
    pub fn message(&self) -> String {
        self.error.to_string()
    }
}
