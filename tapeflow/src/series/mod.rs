//! User-definable derived series.
//!
//! A series couples a raw formula with a declared visual type and numeric
//! options. [`transpile`] compiles the formula into a [`SerieModel`] (typed
//! expression, instruction declarations, referenced series) and
//! [`SerieAdapter`] evaluates it against explicit per-renderer state.

pub mod adapter;
pub mod expr;
pub mod instruction;
pub mod transpile;

pub use adapter::SerieAdapter;
pub use instruction::{ArgValue, FunctionDecl, FunctionKind, SerieState, VariableDecl};
pub use transpile::{Expr, TranspileContext, transpile};

use crate::error::SeriesError;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::str::FromStr;

/// Identifier of one user-visible series.
pub type SerieId = SmolStr;

/// Resolved numeric options for one series, read by `options.<key>`
/// references and by instruction window arguments.
pub type SerieOptions = FnvHashMap<SmolStr, f64>;

/// Closed set of visual types a series can declare.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum VisualType {
    #[display("line")]
    Line,
    #[display("area")]
    Area,
    #[display("histogram")]
    Histogram,
    #[display("candlestick")]
    Candlestick,
    #[display("bar")]
    Bar,
    #[display("custom")]
    Custom,
}

impl VisualType {
    /// True when this visual needs a full OHLC output.
    pub fn needs_ohlc(&self) -> bool {
        matches!(self, VisualType::Candlestick | VisualType::Bar)
    }
}

impl FromStr for VisualType {
    type Err = SeriesError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "line" => Ok(VisualType::Line),
            "area" => Ok(VisualType::Area),
            "histogram" => Ok(VisualType::Histogram),
            "candlestick" => Ok(VisualType::Candlestick),
            "bar" => Ok(VisualType::Bar),
            "custom" => Ok(VisualType::Custom),
            other => Err(SeriesError::UnknownVisual(other.to_string())),
        }
    }
}

/// Inferred shape of a series' per-bucket output.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[display("value")]
    Value,
    #[display("ohlc")]
    Ohlc,
    #[display("custom")]
    Custom,
}

/// User-authored configuration of one series. Survives unbinding.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SerieDefinition {
    pub id: SerieId,
    pub visual: VisualType,
    pub formula: String,
    #[serde(default)]
    pub options: SerieOptions,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SerieDefinition {
    pub fn new(id: impl Into<SerieId>, visual: VisualType, formula: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            visual,
            formula: formula.into(),
            options: SerieOptions::default(),
            enabled: true,
        }
    }

    pub fn with_option(mut self, key: impl Into<SmolStr>, value: f64) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// A registered series: user configuration coupled with its compiled model
/// and executable adapter.
///
/// `model` and `adapter` are `None` while the formula fails to compile; the
/// configuration survives so the series can be corrected and retried, but it
/// stays unbound in the meantime.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSerie {
    pub definition: SerieDefinition,
    pub model: Option<SerieModel>,
    pub adapter: Option<SerieAdapter>,
}

impl ActiveSerie {
    /// A series whose formula compiled.
    pub fn compiled(definition: SerieDefinition, model: SerieModel) -> Self {
        let adapter = SerieAdapter::new(&model);
        Self {
            definition,
            model: Some(model),
            adapter: Some(adapter),
        }
    }

    /// A series whose formula failed to compile.
    pub fn broken(definition: SerieDefinition) -> Self {
        Self {
            definition,
            model: None,
            adapter: None,
        }
    }
}

/// Compiled artifact of one formula.
#[derive(Debug, Clone, PartialEq)]
pub struct SerieModel {
    /// Variable assignments executed in order before the output expression.
    pub assignments: Vec<(usize, Expr)>,
    /// The rewritten output expression.
    pub output: Expr,
    pub output_kind: OutputKind,
    /// Stateful function call sites, in allocation order.
    pub functions: Vec<FunctionDecl>,
    /// Declared variables, in declaration order.
    pub variables: Vec<VariableDecl>,
    /// Other series this formula reads.
    pub references: Vec<SerieId>,
}
