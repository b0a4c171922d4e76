//! Compiled formula instructions and their persistent cross-bucket state.
//!
//! Each stateful function call site in a formula owns one instruction whose
//! state lives per renderer instance: cloned fresh whenever a series is
//! (re)bound, advanced exactly once per closed bucket that had data, and
//! never shared between the live renderer and a replay renderer.

use crate::series::{SerieModel, SerieOptions};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::VecDeque;

/// Stateful function primitives available in formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum FunctionKind {
    /// Rolling arithmetic mean over a window.
    Avg,
    /// Rolling sum over a window.
    Sum,
    /// Running (unbounded) sum.
    Cum,
    /// Highest value over a window.
    Highest,
    /// Lowest value over a window.
    Lowest,
    /// Value `window` buckets back.
    Last,
    /// OHLC built from a scalar, carried across buckets.
    Ohlc,
}

impl FunctionKind {
    /// Resolve a formula function name, with its arity.
    pub fn from_name(name: &str) -> Option<(Self, usize)> {
        match name {
            "avg" => Some((FunctionKind::Avg, 2)),
            "sum" => Some((FunctionKind::Sum, 2)),
            "cum" => Some((FunctionKind::Cum, 1)),
            "highest" => Some((FunctionKind::Highest, 2)),
            "lowest" => Some((FunctionKind::Lowest, 2)),
            "last" => Some((FunctionKind::Last, 2)),
            "ohlc" => Some((FunctionKind::Ohlc, 1)),
            _ => None,
        }
    }

    /// True when the function takes a trailing window-length argument.
    pub fn has_window(&self) -> bool {
        !matches!(self, FunctionKind::Cum | FunctionKind::Ohlc)
    }
}

/// A window-length constructor argument: a literal, or an options key
/// re-resolved when live configuration changes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ArgValue {
    Literal(f64),
    Option(SmolStr),
}

impl ArgValue {
    /// Resolve against current options, clamped to a usable window.
    pub fn resolve(&self, options: &SerieOptions) -> usize {
        let raw = match self {
            ArgValue::Literal(value) => *value,
            ArgValue::Option(key) => options.get(key).copied().unwrap_or(1.0),
        };
        (raw.max(1.0)) as usize
    }
}

/// One stateful function call site.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FunctionDecl {
    pub kind: FunctionKind,
    pub window: Option<ArgValue>,
}

/// One declared formula variable, with its history window.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VariableDecl {
    pub name: SmolStr,
    pub window: usize,
}

/// Per-renderer state of one function instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionState {
    Average {
        window: usize,
        /// Closed-bucket inputs, oldest first, at most `window` entries.
        queue: VecDeque<f64>,
        sum: f64,
        /// Input seen in the bucket being accumulated, pushed on advance.
        last: f64,
    },
    Cumulative {
        sum: f64,
        last: f64,
    },
    Array {
        window: usize,
        /// Closed-bucket inputs, newest first, at most `window` entries.
        history: VecDeque<f64>,
        last: f64,
    },
    Ohlc {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        seeded: bool,
    },
}

impl FunctionState {
    pub fn new(decl: &FunctionDecl, options: &SerieOptions) -> Self {
        let window = decl
            .window
            .as_ref()
            .map(|arg| arg.resolve(options))
            .unwrap_or(1);
        match decl.kind {
            FunctionKind::Avg | FunctionKind::Sum => FunctionState::Average {
                window,
                queue: VecDeque::with_capacity(window),
                sum: 0.0,
                last: 0.0,
            },
            FunctionKind::Cum => FunctionState::Cumulative { sum: 0.0, last: 0.0 },
            FunctionKind::Highest | FunctionKind::Lowest | FunctionKind::Last => {
                FunctionState::Array {
                    window,
                    history: VecDeque::with_capacity(window),
                    last: 0.0,
                }
            }
            FunctionKind::Ohlc => FunctionState::Ohlc {
                open: 0.0,
                high: 0.0,
                low: 0.0,
                close: 0.0,
                seeded: false,
            },
        }
    }

    /// Fold the closed bucket's input into persistent state.
    pub fn advance(&mut self) {
        match self {
            FunctionState::Average {
                window,
                queue,
                sum,
                last,
            } => {
                queue.push_back(*last);
                *sum += *last;
                while queue.len() > *window {
                    if let Some(evicted) = queue.pop_front() {
                        *sum -= evicted;
                    }
                }
            }
            FunctionState::Cumulative { sum, last } => {
                *sum += *last;
            }
            FunctionState::Array {
                window,
                history,
                last,
            } => {
                history.push_front(*last);
                while history.len() > *window {
                    history.pop_back();
                }
            }
            FunctionState::Ohlc {
                open,
                high,
                low,
                close,
                ..
            } => {
                *open = *close;
                *high = *close;
                *low = *close;
            }
        }
    }

    /// Re-apply a resolved window length, evicting surplus history.
    pub fn resize(&mut self, new_window: usize) {
        match self {
            FunctionState::Average { window, queue, sum, .. } => {
                *window = new_window;
                while queue.len() > *window {
                    if let Some(evicted) = queue.pop_front() {
                        *sum -= evicted;
                    }
                }
            }
            FunctionState::Array { window, history, .. } => {
                *window = new_window;
                while history.len() > *window {
                    history.pop_back();
                }
            }
            _ => {}
        }
    }
}

/// Per-renderer state of one declared variable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VariableState {
    pub window: usize,
    /// Value assigned in the bucket being accumulated.
    pub current: f64,
    /// Closed-bucket values, newest first, at most `window` entries.
    pub history: VecDeque<f64>,
}

impl VariableState {
    pub fn new(decl: &VariableDecl) -> Self {
        Self {
            window: decl.window,
            current: 0.0,
            history: VecDeque::with_capacity(decl.window),
        }
    }

    /// Read the value `offset` buckets back; 0 reads the current value.
    /// Falls back to the oldest retained value when the history is shorter.
    pub fn lookback(&self, offset: usize) -> f64 {
        if offset == 0 {
            return self.current;
        }
        self.history
            .get(offset - 1)
            .or_else(|| self.history.back())
            .copied()
            .unwrap_or(self.current)
    }

    pub fn advance(&mut self) {
        self.history.push_front(self.current);
        while self.history.len() > self.window {
            self.history.pop_back();
        }
    }
}

/// All instruction state one bound series carries inside one renderer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SerieState {
    pub functions: Vec<FunctionState>,
    pub variables: Vec<VariableState>,
}

impl SerieState {
    /// Fresh state for a (re)bind: windows resolved against current options.
    pub fn new(model: &SerieModel, options: &SerieOptions) -> Self {
        Self {
            functions: model
                .functions
                .iter()
                .map(|decl| FunctionState::new(decl, options))
                .collect(),
            variables: model.variables.iter().map(VariableState::new).collect(),
        }
    }

    /// Bucket-advance transition, invoked once per closed bucket that had
    /// data, before the next bucket starts accumulating.
    pub fn advance(&mut self) {
        for function in &mut self.functions {
            function.advance();
        }
        for variable in &mut self.variables {
            variable.advance();
        }
    }

    /// Re-resolve options-dependent window arguments without recompiling.
    pub fn update_args(&mut self, model: &SerieModel, options: &SerieOptions) {
        for (decl, state) in model.functions.iter().zip(self.functions.iter_mut()) {
            if let Some(arg @ ArgValue::Option(_)) = &decl.window {
                state.resize(arg.resolve(options));
            }
        }
    }
}
