//! Executable series adapter: a small interpreter over the compiled
//! expression tree.
//!
//! The adapter is pure given its explicit arguments (renderer view,
//! instruction state, options, sibling outputs) — it reads and writes
//! nothing else, so cloned state replays reproducibly.

use crate::renderer::Renderer;
use crate::series::expr::{BinaryOp, UnaryOp};
use crate::series::instruction::{FunctionKind, FunctionState};
use crate::series::transpile::{Expr, StatelessFn};
use crate::series::{OutputKind, SerieId, SerieModel, SerieOptions, SerieState};
use crate::sink::PointValue;
use fnv::FnvHashMap;

/// An intermediate evaluation value: scalar, or OHLC flowing through
/// arithmetic component-wise.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Num(f64),
    Ohlc {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

impl Value {
    fn close(self) -> f64 {
        match self {
            Value::Num(value) => value,
            Value::Ohlc { close, .. } => close,
        }
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Value {
        match self {
            Value::Num(value) => Value::Num(f(value)),
            Value::Ohlc {
                open,
                high,
                low,
                close,
            } => Value::Ohlc {
                open: f(open),
                high: f(high),
                low: f(low),
                close: f(close),
            },
        }
    }
}

/// Compiled, executable evaluation closure for one series.
#[derive(Debug, Clone, PartialEq)]
pub struct SerieAdapter {
    assignments: Vec<(usize, Expr)>,
    output: Expr,
    output_kind: OutputKind,
}

impl SerieAdapter {
    /// Bind an adapter to a compiled model.
    pub fn new(model: &SerieModel) -> Self {
        Self {
            assignments: model.assignments.clone(),
            output: model.output.clone(),
            output_kind: model.output_kind,
        }
    }

    pub fn output_kind(&self) -> OutputKind {
        self.output_kind
    }

    /// Evaluate against a closed renderer and this series' state for that
    /// renderer. `outputs` carries sibling series outputs for this bucket,
    /// already computed in dependency order.
    pub fn eval(
        &self,
        renderer: &Renderer,
        state: &mut SerieState,
        options: &SerieOptions,
        outputs: &FnvHashMap<SerieId, f64>,
    ) -> PointValue {
        let mut ctx = EvalCtx {
            renderer,
            state,
            options,
            outputs,
        };

        for (index, expr) in &self.assignments {
            let value = eval_expr(expr, &mut ctx).close();
            ctx.state.variables[*index].current = value;
        }

        if let Expr::Object(fields) = &self.output {
            let values = fields
                .iter()
                .map(|(key, expr)| (key.clone(), eval_expr(expr, &mut ctx).close()))
                .collect();
            return PointValue::Custom(values);
        }

        let value = eval_expr(&self.output, &mut ctx);
        match self.output_kind {
            OutputKind::Value | OutputKind::Custom => PointValue::Value(value.close()),
            OutputKind::Ohlc => match value {
                Value::Ohlc {
                    open,
                    high,
                    low,
                    close,
                } => PointValue::Ohlc {
                    open,
                    high,
                    low,
                    close,
                },
                Value::Num(value) => PointValue::Ohlc {
                    open: value,
                    high: value,
                    low: value,
                    close: value,
                },
            },
        }
    }
}

struct EvalCtx<'a> {
    renderer: &'a Renderer,
    state: &'a mut SerieState,
    options: &'a SerieOptions,
    outputs: &'a FnvHashMap<SerieId, f64>,
}

fn eval_expr(expr: &Expr, ctx: &mut EvalCtx<'_>) -> Value {
    match expr {
        Expr::Number(value) => Value::Num(*value),
        Expr::Field(field) => Value::Num(ctx.renderer.combined_field(*field)),
        Expr::WholeBar => {
            let (open, high, low, close) = ctx.renderer.combined_ohlc();
            Value::Ohlc {
                open,
                high,
                low,
                close,
            }
        }
        Expr::SourceField(source, field) => {
            Value::Num(ctx.renderer.source_field(source, *field))
        }
        // A missing sibling (unbound or faulted) poisons dependents with NaN
        // so they fault through the normal runtime path.
        Expr::SeriesRef(id) => Value::Num(ctx.outputs.get(id).copied().unwrap_or(f64::NAN)),
        Expr::OptionRef(key) => Value::Num(ctx.options.get(key).copied().unwrap_or(0.0)),
        Expr::Variable(index) => Value::Num(ctx.state.variables[*index].current),
        Expr::VariableLag { index, offset } => {
            let offset = eval_expr(offset, ctx).close().max(0.0) as usize;
            Value::Num(ctx.state.variables[*index].lookback(offset))
        }
        Expr::Function { slot, kind, input } => {
            let input = eval_expr(input, ctx).close();
            eval_function(*kind, &mut ctx.state.functions[*slot], input)
        }
        Expr::Stateless { function, args } => {
            let values: Vec<Value> = args.iter().map(|arg| eval_expr(arg, ctx)).collect();
            eval_stateless(*function, &values)
        }
        Expr::Unary(op, inner) => {
            let value = eval_expr(inner, ctx);
            match op {
                UnaryOp::Neg => value.map(|component| -component),
                UnaryOp::Not => Value::Num(if value.close() == 0.0 { 1.0 } else { 0.0 }),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval_expr(lhs, ctx);
            let rhs = eval_expr(rhs, ctx);
            eval_binary(*op, lhs, rhs)
        }
        Expr::Object(_) => {
            // Root objects are handled in `eval`; nested objects are
            // rejected at transpile time.
            Value::Num(f64::NAN)
        }
    }
}

fn eval_function(kind: FunctionKind, state: &mut FunctionState, input: f64) -> Value {
    match (kind, state) {
        (FunctionKind::Avg, FunctionState::Average { window, queue, sum, last }) => {
            *last = input;
            if queue.len() >= *window {
                let evicting: f64 = queue
                    .iter()
                    .take(queue.len() - (*window - 1))
                    .sum();
                Value::Num((*sum - evicting + input) / *window as f64)
            } else {
                Value::Num((*sum + input) / (queue.len() + 1) as f64)
            }
        }
        (FunctionKind::Sum, FunctionState::Average { window, queue, sum, last }) => {
            *last = input;
            if queue.len() >= *window {
                let evicting: f64 = queue
                    .iter()
                    .take(queue.len() - (*window - 1))
                    .sum();
                Value::Num(*sum - evicting + input)
            } else {
                Value::Num(*sum + input)
            }
        }
        (FunctionKind::Cum, FunctionState::Cumulative { sum, last }) => {
            *last = input;
            Value::Num(*sum + input)
        }
        (FunctionKind::Highest, FunctionState::Array { window, history, last }) => {
            *last = input;
            let mut highest = input;
            for value in history.iter().take(window.saturating_sub(1)) {
                highest = highest.max(*value);
            }
            Value::Num(highest)
        }
        (FunctionKind::Lowest, FunctionState::Array { window, history, last }) => {
            *last = input;
            let mut lowest = input;
            for value in history.iter().take(window.saturating_sub(1)) {
                lowest = lowest.min(*value);
            }
            Value::Num(lowest)
        }
        (FunctionKind::Last, FunctionState::Array { window, history, last }) => {
            *last = input;
            let value = history
                .get(window.saturating_sub(1))
                .or_else(|| history.back())
                .copied()
                .unwrap_or(input);
            Value::Num(value)
        }
        (FunctionKind::Ohlc, FunctionState::Ohlc { open, high, low, close, seeded }) => {
            if !*seeded {
                *open = input;
                *high = input;
                *low = input;
                *seeded = true;
            }
            *high = high.max(input);
            *low = low.min(input);
            *close = input;
            Value::Ohlc {
                open: *open,
                high: *high,
                low: *low,
                close: *close,
            }
        }
        // Declaration and state are built together; a mismatch cannot be
        // reached through the public API.
        _ => Value::Num(f64::NAN),
    }
}

fn eval_stateless(function: StatelessFn, args: &[Value]) -> Value {
    match function {
        StatelessFn::Abs => args[0].map(f64::abs),
        StatelessFn::Sqrt => args[0].map(f64::sqrt),
        StatelessFn::Floor => args[0].map(f64::floor),
        StatelessFn::Ceil => args[0].map(f64::ceil),
        StatelessFn::Round => args[0].map(f64::round),
        StatelessFn::Sign => args[0].map(f64::signum),
        StatelessFn::Min => Value::Num(args[0].close().min(args[1].close())),
        StatelessFn::Max => Value::Num(args[0].close().max(args[1].close())),
        StatelessFn::Pow => Value::Num(args[0].close().powf(args[1].close())),
    }
}

fn eval_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Value {
    let arithmetic = |f: fn(f64, f64) -> f64| match (lhs, rhs) {
        (Value::Num(a), Value::Num(b)) => Value::Num(f(a, b)),
        (a, b) => {
            // Component-wise with scalar broadcast.
            let component = |pick: fn(Value) -> f64| f(pick(a), pick(b));
            Value::Ohlc {
                open: component(|value| match value {
                    Value::Num(n) => n,
                    Value::Ohlc { open, .. } => open,
                }),
                high: component(|value| match value {
                    Value::Num(n) => n,
                    Value::Ohlc { high, .. } => high,
                }),
                low: component(|value| match value {
                    Value::Num(n) => n,
                    Value::Ohlc { low, .. } => low,
                }),
                close: component(|value| match value {
                    Value::Num(n) => n,
                    Value::Ohlc { close, .. } => close,
                }),
            }
        }
    };
    let compare = |holds: bool| Value::Num(if holds { 1.0 } else { 0.0 });

    match op {
        BinaryOp::Add => arithmetic(|a, b| a + b),
        BinaryOp::Sub => arithmetic(|a, b| a - b),
        BinaryOp::Mul => arithmetic(|a, b| a * b),
        BinaryOp::Div => arithmetic(|a, b| a / b),
        BinaryOp::Rem => arithmetic(|a, b| a % b),
        BinaryOp::Eq => compare(lhs.close() == rhs.close()),
        BinaryOp::Ne => compare(lhs.close() != rhs.close()),
        BinaryOp::Lt => compare(lhs.close() < rhs.close()),
        BinaryOp::Le => compare(lhs.close() <= rhs.close()),
        BinaryOp::Gt => compare(lhs.close() > rhs.close()),
        BinaryOp::Ge => compare(lhs.close() >= rhs.close()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::transpile::{TranspileContext, transpile};
    use crate::series::{SerieDefinition, VisualType};
    use crate::trade::{Side, SourceId, Trade};
    use fnv::FnvHashSet;

    fn renderer_with_trades(trades: &[(f64, f64, Side)]) -> Renderer {
        let active: FnvHashSet<SourceId> = [SourceId::new("BINANCE")].into_iter().collect();
        let mut renderer = Renderer::new(0, active);
        for (price, amount, side) in trades {
            renderer.fold_trade(&Trade {
                exchange: SourceId::new("BINANCE"),
                market: "btcusdt".into(),
                price: *price,
                amount: *amount,
                side: *side,
                liquidation: false,
                time: 0,
            });
        }
        renderer
    }

    fn compile(formula: &str) -> (SerieModel, SerieAdapter, SerieState) {
        let definition = SerieDefinition::new("test", VisualType::Line, formula);
        let model = transpile(&definition, &TranspileContext::default()).unwrap();
        let state = SerieState::new(&model, &definition.options);
        let adapter = SerieAdapter::new(&model);
        (model, adapter, state)
    }

    #[test]
    fn test_field_arithmetic() {
        let renderer = renderer_with_trades(&[(100.0, 1.5, Side::Buy), (99.0, 0.5, Side::Sell)]);
        let (_, adapter, mut state) = compile("vbuy - vsell");
        let value = adapter.eval(
            &renderer,
            &mut state,
            &SerieOptions::default(),
            &FnvHashMap::default(),
        );
        // Notional: 100*1.5 bought minus 99*0.5 sold
        assert_eq!(value, PointValue::Value(100.5));
    }

    #[test]
    fn test_rolling_average_across_buckets() {
        let (_, adapter, mut state) = compile("avg(vbuy, 3)");
        let options = SerieOptions::default();
        let outputs = FnvHashMap::default();

        // Bucket inputs at price 100: 100, 200, 300, 400 over a window of 3
        let expected = [100.0, 150.0, 200.0, 300.0];
        for (index, amount) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            let mut renderer = renderer_with_trades(&[(100.0, amount, Side::Buy)]);
            renderer.time = index as i64 * 60_000;
            let value = adapter.eval(&renderer, &mut state, &options, &outputs);
            assert_eq!(
                value,
                PointValue::Value(expected[index]),
                "bucket {index} mean mismatch"
            );
            state.advance();
        }
    }

    #[test]
    fn test_cum_and_last() {
        let (_, adapter, mut state) = compile("cum(vbuy) + last(vbuy, 2) * 0");
        let options = SerieOptions::default();
        let outputs = FnvHashMap::default();

        let mut total = 0.0;
        for amount in [1.0, 2.0, 3.0] {
            let renderer = renderer_with_trades(&[(100.0, amount, Side::Buy)]);
            let value = adapter.eval(&renderer, &mut state, &options, &outputs);
            total += amount * 100.0;
            assert_eq!(value, PointValue::Value(total));
            state.advance();
        }
    }

    #[test]
    fn test_lag_reads_buckets_back() {
        let (_, adapter, mut state) = compile("last(vbuy, 2)");
        let options = SerieOptions::default();
        let outputs = FnvHashMap::default();

        let amounts = [10.0, 20.0, 30.0, 40.0];
        let mut seen = Vec::new();
        for amount in amounts {
            let renderer = renderer_with_trades(&[(100.0, amount, Side::Buy)]);
            let value = adapter.eval(&renderer, &mut state, &options, &outputs);
            seen.push(value);
            state.advance();
        }
        // Bucket 2 reads bucket 0; bucket 3 reads bucket 1.
        assert_eq!(seen[2], PointValue::Value(1_000.0));
        assert_eq!(seen[3], PointValue::Value(2_000.0));
    }

    #[test]
    fn test_ohlc_output_and_carry() {
        let definition = SerieDefinition::new("price", VisualType::Candlestick, "ohlc(close)");
        let model = transpile(&definition, &TranspileContext::default()).unwrap();
        let adapter = SerieAdapter::new(&model);
        let mut state = SerieState::new(&model, &definition.options);
        let outputs = FnvHashMap::default();

        let renderer = renderer_with_trades(&[(100.0, 1.0, Side::Buy)]);
        let first = adapter.eval(&renderer, &mut state, &definition.options, &outputs);
        assert_eq!(
            first,
            PointValue::Ohlc {
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0
            }
        );
        state.advance();

        let renderer = renderer_with_trades(&[(104.0, 1.0, Side::Buy)]);
        let second = adapter.eval(&renderer, &mut state, &definition.options, &outputs);
        // Close carried forward as the next bucket's open.
        assert_eq!(
            second,
            PointValue::Ohlc {
                open: 100.0,
                high: 104.0,
                low: 100.0,
                close: 104.0
            }
        );
    }

    #[test]
    fn test_missing_series_reference_poisons_with_nan() {
        let definition = SerieDefinition::new("dependent", VisualType::Line, "cvd * 2");
        let series = vec![SerieId::new("cvd")];
        let model = transpile(
            &definition,
            &TranspileContext {
                sources: &[],
                series: &series,
            },
        )
        .unwrap();
        let adapter = SerieAdapter::new(&model);
        let mut state = SerieState::new(&model, &definition.options);

        let renderer = renderer_with_trades(&[(100.0, 1.0, Side::Buy)]);
        let value = adapter.eval(
            &renderer,
            &mut state,
            &definition.options,
            &FnvHashMap::default(),
        );
        assert!(value.has_nan());
    }

    #[test]
    fn test_comparisons_yield_flags() {
        let renderer = renderer_with_trades(&[(100.0, 2.0, Side::Buy), (99.0, 1.0, Side::Sell)]);
        let (_, adapter, mut state) = compile("vbuy > vsell");
        let value = adapter.eval(
            &renderer,
            &mut state,
            &SerieOptions::default(),
            &FnvHashMap::default(),
        );
        assert_eq!(value, PointValue::Value(1.0));
    }

    #[test]
    fn test_variable_assignment_flow() {
        let (_, adapter, mut state) =
            compile("delta = vbuy - vsell; smoothed = delta * 0.5; smoothed");
        let renderer = renderer_with_trades(&[(100.0, 3.0, Side::Buy), (99.0, 1.0, Side::Sell)]);
        let value = adapter.eval(
            &renderer,
            &mut state,
            &SerieOptions::default(),
            &FnvHashMap::default(),
        );
        // delta = 300 - 99, halved
        assert_eq!(value, PointValue::Value(100.5));
    }
}
