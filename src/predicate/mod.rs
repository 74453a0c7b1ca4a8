// =============================================================================
// Predicate Runtime
// =============================================================================
//
// Trader predicates arrive as source strings in a small infix expression
// language over OHLCV accessors and indicator calls, with an optional
// timeframe qualifier per call:
//
//     close(0) > sma(20) && rsi(14, "5m") < 30
//
// The runtime is an interpreter over a fixed AST: pure by construction (no
// host access, no mutation of inputs) with a wall-clock evaluation budget.

pub mod ast;
pub mod parser;
pub mod runtime;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use runtime::{EvalContext, EvalOutcome, Predicate, PredicateConfig};
