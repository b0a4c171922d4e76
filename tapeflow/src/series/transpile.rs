//! Formula compilation: untyped syntax → typed instruction graph.
//!
//! `transpile` resolves every identifier against the bar-field grammar, the
//! known sources, the series' own declared variables, its options, and the
//! other registered series; allocates one instruction slot per stateful
//! function call site; and infers the output kind, checking it against the
//! declared visual type.

use crate::error::SeriesError;
use crate::series::expr::{self, BinaryOp, RawExpr, RawStatement, UnaryOp};
use crate::series::instruction::{ArgValue, FunctionDecl, FunctionKind, VariableDecl};
use crate::series::{OutputKind, SerieDefinition, SerieId, SerieModel, VisualType};
use crate::trade::SourceId;
use smol_str::SmolStr;

/// Bar fields addressable from formulas, on the combined bar or a
/// source-qualified bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarField {
    Time,
    Open,
    High,
    Low,
    Close,
    Vbuy,
    Vsell,
    Cbuy,
    Csell,
    Lbuy,
    Lsell,
}

impl BarField {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "time" => Some(BarField::Time),
            "open" => Some(BarField::Open),
            "high" => Some(BarField::High),
            "low" => Some(BarField::Low),
            "close" => Some(BarField::Close),
            "vbuy" => Some(BarField::Vbuy),
            "vsell" => Some(BarField::Vsell),
            "cbuy" => Some(BarField::Cbuy),
            "csell" => Some(BarField::Csell),
            "lbuy" => Some(BarField::Lbuy),
            "lsell" => Some(BarField::Lsell),
            _ => None,
        }
    }
}

/// Stateless function primitives, re-evaluated fresh each bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatelessFn {
    Abs,
    Sqrt,
    Floor,
    Ceil,
    Round,
    Sign,
    Min,
    Max,
    Pow,
}

impl StatelessFn {
    pub fn from_name(name: &str) -> Option<(Self, usize)> {
        match name {
            "abs" => Some((StatelessFn::Abs, 1)),
            "sqrt" => Some((StatelessFn::Sqrt, 1)),
            "floor" => Some((StatelessFn::Floor, 1)),
            "ceil" => Some((StatelessFn::Ceil, 1)),
            "round" => Some((StatelessFn::Round, 1)),
            "sign" => Some((StatelessFn::Sign, 1)),
            "min" => Some((StatelessFn::Min, 2)),
            "max" => Some((StatelessFn::Max, 2)),
            "pow" => Some((StatelessFn::Pow, 2)),
            _ => None,
        }
    }
}

/// Typed, resolved expression evaluated by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// Combined-bar field.
    Field(BarField),
    /// The whole combined bar as an OHLC value (`bar`).
    WholeBar,
    /// Named-source bar field.
    SourceField(SourceId, BarField),
    /// Another series' output for this bucket.
    SeriesRef(SerieId),
    /// `options.<key>`.
    OptionRef(SmolStr),
    /// Current value of a declared variable.
    Variable(usize),
    /// `name[k]`: variable value `k` buckets back.
    VariableLag { index: usize, offset: Box<Expr> },
    /// Stateful function call site, bound to an instruction slot.
    Function {
        slot: usize,
        kind: FunctionKind,
        input: Box<Expr>,
    },
    Stateless {
        function: StatelessFn,
        args: Vec<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Custom-point object, root only.
    Object(Vec<(SmolStr, Expr)>),
}

/// Names visible to a formula beyond its own definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranspileContext<'a> {
    /// Known source feeds, addressable as `<source>.<field>`.
    pub sources: &'a [SourceId],
    /// Other registered series, addressable by id.
    pub series: &'a [SerieId],
}

/// Compile a series definition into its executable model.
pub fn transpile(
    definition: &SerieDefinition,
    ctx: &TranspileContext<'_>,
) -> Result<SerieModel, SeriesError> {
    let script = expr::parse_script(&definition.formula)?;

    let mut resolver = Resolver {
        definition,
        ctx,
        functions: Vec::new(),
        variables: Vec::new(),
        references: Vec::new(),
    };

    let mut assignments = Vec::new();
    let mut output = None;

    for statement in &script.statements {
        let RawStatement { target, expr } = statement;
        match target {
            Some(target) => {
                let resolved = resolver.resolve(expr, false)?;
                let index = resolver.declare_variable(&target.name, target.window);
                assignments.push((index, resolved));
            }
            None => {
                output = Some(resolver.resolve(expr, true)?);
            }
        }
    }

    let output = output.expect("parser guarantees a final output expression");
    let output_kind = infer_output_kind(&output);
    check_visual(output_kind, definition.visual)?;

    Ok(SerieModel {
        assignments,
        output,
        output_kind,
        functions: resolver.functions,
        variables: resolver.variables,
        references: resolver.references,
    })
}

fn infer_output_kind(output: &Expr) -> OutputKind {
    match output {
        Expr::Object(_) => OutputKind::Custom,
        Expr::WholeBar => OutputKind::Ohlc,
        Expr::Function {
            kind: FunctionKind::Ohlc,
            ..
        } => OutputKind::Ohlc,
        _ => OutputKind::Value,
    }
}

fn check_visual(output: OutputKind, visual: VisualType) -> Result<(), SeriesError> {
    let ok = if visual == VisualType::Custom {
        true
    } else if visual.needs_ohlc() {
        // A single value cannot drive a candle body.
        output == OutputKind::Ohlc
    } else {
        // OHLC narrows to close for scalar visuals.
        matches!(output, OutputKind::Value | OutputKind::Ohlc)
    };
    if ok {
        Ok(())
    } else {
        Err(SeriesError::OutputMismatch { output, visual })
    }
}

struct Resolver<'a> {
    definition: &'a SerieDefinition,
    ctx: &'a TranspileContext<'a>,
    functions: Vec<FunctionDecl>,
    variables: Vec<VariableDecl>,
    references: Vec<SerieId>,
}

impl Resolver<'_> {
    fn declare_variable(&mut self, name: &SmolStr, window: usize) -> usize {
        if let Some(index) = self.variable_index(name) {
            // Reassignment keeps the widest requested history.
            self.variables[index].window = self.variables[index].window.max(window);
            return index;
        }
        self.variables.push(VariableDecl {
            name: name.clone(),
            window,
        });
        self.variables.len() - 1
    }

    fn variable_index(&self, name: &SmolStr) -> Option<usize> {
        self.variables.iter().position(|decl| &decl.name == name)
    }

    fn resolve(&mut self, raw: &RawExpr, root: bool) -> Result<Expr, SeriesError> {
        match raw {
            RawExpr::Number(value) => Ok(Expr::Number(*value)),
            RawExpr::Ident(name) => self.resolve_ident(name),
            RawExpr::Member(lhs, rhs) => self.resolve_member(lhs, rhs),
            RawExpr::Index(name, offset) => match self.variable_index(name) {
                Some(index) => Ok(Expr::VariableLag {
                    index,
                    offset: Box::new(self.resolve(offset, false)?),
                }),
                None => Err(SeriesError::UnknownReference(name.to_string())),
            },
            RawExpr::Call(name, args) => self.resolve_call(name, args),
            RawExpr::Unary(op, inner) => {
                Ok(Expr::Unary(*op, Box::new(self.resolve(inner, false)?)))
            }
            RawExpr::Binary(op, lhs, rhs) => Ok(Expr::Binary(
                *op,
                Box::new(self.resolve(lhs, false)?),
                Box::new(self.resolve(rhs, false)?),
            )),
            RawExpr::Object(fields) => {
                if !root {
                    return Err(SeriesError::Parse(
                        "object literals are only valid as the output expression".to_string(),
                    ));
                }
                let resolved = fields
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), self.resolve(value, false)?)))
                    .collect::<Result<Vec<_>, SeriesError>>()?;
                Ok(Expr::Object(resolved))
            }
        }
    }

    fn resolve_ident(&mut self, name: &SmolStr) -> Result<Expr, SeriesError> {
        if let Some(field) = BarField::from_name(name) {
            return Ok(Expr::Field(field));
        }
        if name == "bar" {
            return Ok(Expr::WholeBar);
        }
        if let Some(index) = self.variable_index(name) {
            return Ok(Expr::Variable(index));
        }
        if self.ctx.series.iter().any(|id| id == name) && name != &self.definition.id {
            if !self.references.contains(name) {
                self.references.push(name.clone());
            }
            return Ok(Expr::SeriesRef(name.clone()));
        }
        Err(SeriesError::UnknownReference(name.to_string()))
    }

    fn resolve_member(&mut self, lhs: &SmolStr, rhs: &SmolStr) -> Result<Expr, SeriesError> {
        if lhs == "options" {
            return if self.definition.options.contains_key(rhs) {
                Ok(Expr::OptionRef(rhs.clone()))
            } else {
                Err(SeriesError::UnknownReference(format!("options.{rhs}")))
            };
        }
        if self.ctx.sources.iter().any(|source| source == lhs) {
            return match BarField::from_name(rhs) {
                Some(field) => Ok(Expr::SourceField(lhs.clone(), field)),
                None => Err(SeriesError::UnknownReference(format!("{lhs}.{rhs}"))),
            };
        }
        Err(SeriesError::UnknownReference(format!("{lhs}.{rhs}")))
    }

    fn resolve_call(&mut self, name: &SmolStr, args: &[RawExpr]) -> Result<Expr, SeriesError> {
        if let Some((kind, arity)) = FunctionKind::from_name(name) {
            if args.len() != arity {
                return Err(SeriesError::Arity {
                    name: name.to_string(),
                    expected: arity,
                    got: args.len(),
                });
            }
            let input = self.resolve(&args[0], false)?;
            let window = if kind.has_window() {
                Some(self.window_argument(name, &args[1])?)
            } else {
                None
            };
            self.functions.push(FunctionDecl { kind, window });
            return Ok(Expr::Function {
                slot: self.functions.len() - 1,
                kind,
                input: Box::new(input),
            });
        }

        if let Some((function, arity)) = StatelessFn::from_name(name) {
            if args.len() != arity {
                return Err(SeriesError::Arity {
                    name: name.to_string(),
                    expected: arity,
                    got: args.len(),
                });
            }
            let args = args
                .iter()
                .map(|arg| self.resolve(arg, false))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Expr::Stateless { function, args });
        }

        Err(SeriesError::UnknownReference(name.to_string()))
    }

    /// Window arguments must stay re-resolvable without recompiling, so only
    /// literals and options references are accepted.
    fn window_argument(&self, name: &SmolStr, arg: &RawExpr) -> Result<ArgValue, SeriesError> {
        match arg {
            RawExpr::Number(value) => Ok(ArgValue::Literal(*value)),
            RawExpr::Member(lhs, rhs) if lhs == "options" => {
                if self.definition.options.contains_key(rhs) {
                    Ok(ArgValue::Option(rhs.clone()))
                } else {
                    Err(SeriesError::UnknownReference(format!("options.{rhs}")))
                }
            }
            _ => Err(SeriesError::WindowArgument(name.to_string())),
        }
    }
}
