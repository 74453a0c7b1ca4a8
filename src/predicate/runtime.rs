// =============================================================================
// Predicate evaluator
// =============================================================================
//
// Interprets a parsed expression against a frozen view of market data. The
// evaluator cannot reach the host: its only inputs are the context slices,
// and every indicator call goes through the pure indicator library. A
// wall-clock deadline is checked at every node.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::errors::ScreenerError;
use crate::indicators;
use crate::indicators::hvn::VolumeNode;
use crate::market_data::kline::Kline;
use crate::predicate::ast::{BinaryOp, Expr, UnaryOp};
use crate::predicate::parser;
use crate::types::{Interval, Ticker};

/// Evaluation limits.
#[derive(Debug, Clone, Copy)]
pub struct PredicateConfig {
    pub max_eval_ms: u64,
    /// Hard cap on expression size, enforced at parse time.
    pub max_nodes: usize,
}

impl Default for PredicateConfig {
    fn default() -> Self {
        Self {
            max_eval_ms: 250,
            max_nodes: 10_000,
        }
    }
}

/// The frozen view a predicate evaluates against. All series are closed bars
/// only, oldest first. Slices keep the context cheap to rebuild per bar when
/// the historical scanner truncates views.
pub struct EvalContext<'a> {
    pub ticker: Option<&'a Ticker>,
    pub timeframes: &'a HashMap<Interval, &'a [Kline]>,
    /// Timeframe used when a call does not name one.
    pub default_interval: Interval,
    pub hvn_nodes: &'a [VolumeNode],
}

/// Result of a successful evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalOutcome {
    pub matched: bool,
    pub elapsed: Duration,
}

/// A compiled predicate, ready for repeated evaluation.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    expr: Expr,
    config: PredicateConfig,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Num(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Num(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Str(_) => "string",
        }
    }

    fn as_num(&self) -> Result<f64, ScreenerError> {
        match self {
            Value::Num(n) => Ok(*n),
            other => Err(ScreenerError::PredicateFailed(format!(
                "expected a number, got {}",
                other.type_name()
            ))),
        }
    }

    fn as_bool(&self) -> Result<bool, ScreenerError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ScreenerError::PredicateFailed(format!(
                "expected a boolean, got {}",
                other.type_name()
            ))),
        }
    }
}

impl Predicate {
    /// Parse and size-check a predicate source string.
    pub fn parse(source: &str, config: PredicateConfig) -> Result<Self, ScreenerError> {
        let expr = parser::parse(source)?;
        let nodes = expr.node_count();
        if nodes > config.max_nodes {
            return Err(ScreenerError::PredicateParse(format!(
                "predicate too large: {nodes} nodes (limit {})",
                config.max_nodes
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
            config,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a frozen context. The result is a strict boolean;
    /// anything else fails with `PredicateFailed`.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<EvalOutcome, ScreenerError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.max_eval_ms);
        let evaluator = Evaluator {
            ctx,
            deadline,
            budget_ms: self.config.max_eval_ms,
        };
        let value = evaluator.eval(&self.expr)?;
        let matched = value.as_bool().map_err(|_| {
            ScreenerError::PredicateFailed("predicate must evaluate to a boolean".into())
        })?;
        Ok(EvalOutcome {
            matched,
            elapsed: started.elapsed(),
        })
    }
}

struct Evaluator<'a, 'b> {
    ctx: &'b EvalContext<'a>,
    deadline: Instant,
    budget_ms: u64,
}

impl Evaluator<'_, '_> {
    fn eval(&self, expr: &Expr) -> Result<Value, ScreenerError> {
        if Instant::now() >= self.deadline {
            return Err(ScreenerError::PredicateTimeout {
                budget_ms: self.budget_ms,
            });
        }

        match expr {
            Expr::Number(n) => Ok(Value::Num(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.as_bool()?)),
                    UnaryOp::Neg => Ok(Value::Num(-value.as_num()?)),
                }
            }
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs),
            Expr::Call { name, args } => self.eval_call(name, args),
        }
    }

    fn eval_binary(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value, ScreenerError> {
        // Short-circuit the logical operators.
        match op {
            BinaryOp::And => {
                return Ok(Value::Bool(
                    self.eval(lhs)?.as_bool()? && self.eval(rhs)?.as_bool()?,
                ));
            }
            BinaryOp::Or => {
                return Ok(Value::Bool(
                    self.eval(lhs)?.as_bool()? || self.eval(rhs)?.as_bool()?,
                ));
            }
            _ => {}
        }

        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;

        match op {
            BinaryOp::Add => Ok(Value::Num(l.as_num()? + r.as_num()?)),
            BinaryOp::Sub => Ok(Value::Num(l.as_num()? - r.as_num()?)),
            BinaryOp::Mul => Ok(Value::Num(l.as_num()? * r.as_num()?)),
            BinaryOp::Div => {
                let divisor = r.as_num()?;
                if divisor == 0.0 {
                    return Err(ScreenerError::PredicateFailed("division by zero".into()));
                }
                Ok(Value::Num(l.as_num()? / divisor))
            }
            BinaryOp::Gt => Ok(Value::Bool(l.as_num()? > r.as_num()?)),
            BinaryOp::Lt => Ok(Value::Bool(l.as_num()? < r.as_num()?)),
            BinaryOp::Ge => Ok(Value::Bool(l.as_num()? >= r.as_num()?)),
            BinaryOp::Le => Ok(Value::Bool(l.as_num()? <= r.as_num()?)),
            BinaryOp::Eq => self.eval_eq(l, r, false),
            BinaryOp::Ne => self.eval_eq(l, r, true),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn eval_eq(&self, l: Value, r: Value, negate: bool) -> Result<Value, ScreenerError> {
        let eq = match (&l, &r) {
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => {
                return Err(ScreenerError::PredicateFailed(format!(
                    "cannot compare {} with {}",
                    l.type_name(),
                    r.type_name()
                )));
            }
        };
        Ok(Value::Bool(eq != negate))
    }

    // -------------------------------------------------------------------------
    // Function dispatch
    // -------------------------------------------------------------------------

    fn eval_call(&self, name: &str, args: &[Expr]) -> Result<Value, ScreenerError> {
        // A trailing string literal names the timeframe; everything before it
        // is a numeric argument.
        let (timeframe, numeric_args) = self.split_args(args)?;
        let klines = self.klines_for(timeframe)?;
        let a = &numeric_args;

        let value = match name {
            // --- OHLCV accessors: arg = bars back from the latest closed ---
            "close" => Value::Num(self.bar_field(klines, a, |k| k.close)?),
            "open" => Value::Num(self.bar_field(klines, a, |k| k.open)?),
            "high" => Value::Num(self.bar_field(klines, a, |k| k.high)?),
            "low" => Value::Num(self.bar_field(klines, a, |k| k.low)?),
            "volume" => Value::Num(self.bar_field(klines, a, |k| k.volume)?),

            // --- Ticker ---
            "price" => Value::Num(self.current_price(klines)?),
            "change_24h" => Value::Num(self.ticker_field(name, |t| t.percent_change_24h)?),
            "quote_volume_24h" => Value::Num(self.ticker_field(name, |t| t.quote_volume_24h)?),

            // --- Moving averages / momentum ---
            "sma" => self.required(
                indicators::ma::sma_latest(&indicators::closes(klines), self.period(a, 0)?),
                name,
            )?,
            "ema" => self.required(
                indicators::ma::ema_latest(&indicators::closes(klines), self.period(a, 0)?),
                name,
            )?,
            "rsi" => self.required(
                indicators::rsi::rsi_latest(&indicators::closes(klines), self.period(a, 0)?),
                name,
            )?,
            "adx" => self.required(indicators::adx::adx_latest(klines, self.period(a, 0)?), name)?,
            "avg_volume" => {
                self.required(indicators::volume::average_volume(klines, self.period(a, 0)?), name)?
            }
            "pvi" => self.required(indicators::volume::pvi_latest(klines), name)?,

            // --- MACD (defaults 12, 26, 9) ---
            "macd_line" | "macd_signal" | "macd_hist" => {
                let fast = self.period_or(a, 0, 12)?;
                let slow = self.period_or(a, 1, 26)?;
                let signal = self.period_or(a, 2, 9)?;
                let macd =
                    indicators::macd::macd_latest(&indicators::closes(klines), fast, slow, signal);
                let macd = self.required_raw(macd, name)?;
                Value::Num(match name {
                    "macd_line" => macd.line,
                    "macd_signal" => macd.signal,
                    _ => macd.histogram,
                })
            }

            // --- Bollinger (defaults 20, 2.0) ---
            "bb_upper" | "bb_middle" | "bb_lower" | "bb_width" => {
                let period = self.period_or(a, 0, 20)?;
                let k = a.get(1).copied().unwrap_or(2.0);
                let bands =
                    indicators::bollinger::bollinger_latest(&indicators::closes(klines), period, k);
                let bands = self.required_raw(bands, name)?;
                Value::Num(match name {
                    "bb_upper" => bands.upper,
                    "bb_middle" => bands.middle,
                    "bb_lower" => bands.lower,
                    _ => bands.width,
                })
            }

            // --- VWAP ---
            "vwap" => self.required(indicators::vwap::vwap_latest(klines, None), name)?,
            "vwap_upper" | "vwap_lower" => {
                let k = a.first().copied().unwrap_or(2.0);
                let (upper, _vwap, lower) =
                    self.required_raw(indicators::vwap::vwap_bands(klines, k, None), name)?;
                Value::Num(if name == "vwap_upper" { upper } else { lower })
            }

            // --- Stochastics ---
            "stoch_k" | "stoch_d" => {
                let kp = self.period_or(a, 0, 14)?;
                let dp = self.period_or(a, 1, 3)?;
                let (k, d) =
                    self.required_raw(indicators::stochastic::stochastic_latest(klines, kp, dp), name)?;
                Value::Num(if name == "stoch_k" { k } else { d })
            }
            "stoch_rsi_k" | "stoch_rsi_d" => {
                let rsi_p = self.period_or(a, 0, 14)?;
                let stoch_p = self.period_or(a, 1, 14)?;
                let ks = self.period_or(a, 2, 3)?;
                let ds = self.period_or(a, 3, 3)?;
                let (k, d) = self.required_raw(
                    indicators::stochastic::stoch_rsi_latest(
                        &indicators::closes(klines),
                        rsi_p,
                        stoch_p,
                        ks,
                        ds,
                    ),
                    name,
                )?;
                Value::Num(if name == "stoch_rsi_k" { k } else { d })
            }

            // --- Extremes and patterns ---
            "highest" => self.required(indicators::patterns::highest_high(klines, self.period(a, 0)?), name)?,
            "lowest" => self.required(indicators::patterns::lowest_low(klines, self.period(a, 0)?), name)?,
            "bullish_engulfing" => Value::Bool(indicators::patterns::is_bullish_engulfing(klines)),
            "bearish_engulfing" => Value::Bool(indicators::patterns::is_bearish_engulfing(klines)),
            "bullish_divergence" => Value::Bool(indicators::rsi::bullish_divergence(
                &indicators::closes(klines),
                self.period_or(a, 0, 14)?,
                self.period_or(a, 1, 20)?,
            )),
            "bearish_divergence" => Value::Bool(indicators::rsi::bearish_divergence(
                &indicators::closes(klines),
                self.period_or(a, 0, 14)?,
                self.period_or(a, 1, 20)?,
            )),

            // --- High-volume nodes ---
            "near_hvn" => {
                let tolerance = a.first().copied().unwrap_or(0.5);
                let price = self.current_price(klines)?;
                Value::Bool(indicators::hvn::is_near_hvn(self.ctx.hvn_nodes, price, tolerance))
            }
            "hvn_count" => {
                let low = self.arg(a, 0, name)?;
                let high = self.arg(a, 1, name)?;
                Value::Num(indicators::hvn::count_hvn_in_range(self.ctx.hvn_nodes, low, high) as f64)
            }
            "closest_hvn_price" => {
                let price = self.current_price(klines)?;
                let node = indicators::hvn::closest_hvn(self.ctx.hvn_nodes, price);
                self.required(node.map(|n| n.price), name)?
            }

            other => {
                return Err(ScreenerError::PredicateFailed(format!(
                    "unknown function '{other}'"
                )));
            }
        };

        Ok(value)
    }

    /// Split call arguments into (optional trailing timeframe, numeric args).
    fn split_args(&self, args: &[Expr]) -> Result<(Option<Interval>, Vec<f64>), ScreenerError> {
        let mut timeframe = None;
        let mut numeric = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            match self.eval(arg)? {
                Value::Str(s) => {
                    if i != args.len() - 1 {
                        return Err(ScreenerError::PredicateFailed(
                            "timeframe must be the last argument".into(),
                        ));
                    }
                    timeframe = Some(Interval::parse(&s).ok_or_else(|| {
                        ScreenerError::PredicateFailed(format!("unknown timeframe '{s}'"))
                    })?);
                }
                Value::Num(n) => numeric.push(n),
                Value::Bool(_) => {
                    return Err(ScreenerError::PredicateFailed(
                        "boolean is not a valid function argument".into(),
                    ));
                }
            }
        }
        Ok((timeframe, numeric))
    }

    fn klines_for(&self, timeframe: Option<Interval>) -> Result<&[Kline], ScreenerError> {
        let interval = timeframe.unwrap_or(self.ctx.default_interval);
        self.ctx.timeframes.get(&interval).copied().ok_or_else(|| {
            ScreenerError::PredicateFailed(format!("timeframe {interval} not available"))
        })
    }

    fn bar_field(
        &self,
        klines: &[Kline],
        args: &[f64],
        f: impl Fn(&Kline) -> f64,
    ) -> Result<f64, ScreenerError> {
        let back = self.period_or(args, 0, 0)?;
        if back >= klines.len() {
            return Err(ScreenerError::PredicateFailed(format!(
                "only {} bars available, requested {} back",
                klines.len(),
                back
            )));
        }
        Ok(f(&klines[klines.len() - 1 - back]))
    }

    fn ticker_field(
        &self,
        name: &str,
        f: impl Fn(&Ticker) -> f64,
    ) -> Result<f64, ScreenerError> {
        self.ctx.ticker.map(f).ok_or_else(|| {
            ScreenerError::PredicateFailed(format!("{name}() requires ticker data"))
        })
    }

    /// Ticker price when available, otherwise the latest close.
    fn current_price(&self, klines: &[Kline]) -> Result<f64, ScreenerError> {
        if let Some(t) = self.ctx.ticker {
            return Ok(t.last_price);
        }
        klines
            .last()
            .map(|k| k.close)
            .ok_or_else(|| ScreenerError::PredicateFailed("no price data available".into()))
    }

    fn arg(&self, args: &[f64], index: usize, name: &str) -> Result<f64, ScreenerError> {
        args.get(index).copied().ok_or_else(|| {
            ScreenerError::PredicateFailed(format!("{name}() is missing argument {index}"))
        })
    }

    /// Required integer argument at `index`.
    fn period(&self, args: &[f64], index: usize) -> Result<usize, ScreenerError> {
        let raw = args.get(index).copied().ok_or_else(|| {
            ScreenerError::PredicateFailed(format!("missing period argument {index}"))
        })?;
        to_usize(raw)
    }

    /// Integer argument at `index`, with a default.
    fn period_or(&self, args: &[f64], index: usize, default: usize) -> Result<usize, ScreenerError> {
        match args.get(index) {
            Some(&raw) => to_usize(raw),
            None => Ok(default),
        }
    }

    fn required(&self, value: Option<f64>, name: &str) -> Result<Value, ScreenerError> {
        self.required_raw(value, name).map(Value::Num)
    }

    fn required_raw<T>(&self, value: Option<T>, name: &str) -> Result<T, ScreenerError> {
        value.ok_or_else(|| {
            ScreenerError::PredicateFailed(format!("insufficient data for {name}()"))
        })
    }
}

fn to_usize(raw: f64) -> Result<usize, ScreenerError> {
    if raw < 0.0 || raw.fract() != 0.0 || raw > 1_000_000.0 {
        return Err(ScreenerError::PredicateFailed(format!(
            "expected a small non-negative integer, got {raw}"
        )));
    }
    Ok(raw as usize)
}
