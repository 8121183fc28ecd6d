//! Stat expressions and their compilation into engine instructions.
//!
//! A [`Stat`] is an immutable expression tree. Pushing it onto a session compiles it into a
//! postfix [`Token`] sequence that the engine evaluates per document, left to right, on its own
//! evaluation stack. The only context compilation needs is the current depth of that stack (to
//! turn [`Stat::StatReference`] back-references into relative offsets) and the registries that
//! decide whether referenced stack slots and dynamic metrics are still alive.
use crate::engine::{IqlError, IqlResult};
use crate::reference::{DynamicMetric, MetricRegistry, SingleStatReference, StatReference, StatStack};
use std::fmt;

/// Per-document arithmetic evaluated by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
    Equals,
    NotEquals,
    Min,
    Max,
}

impl StatOp {
    pub fn symbol(self) -> &'static str {
        match self {
            StatOp::Add => "+",
            StatOp::Subtract => "-",
            StatOp::Multiply => "*",
            StatOp::Divide => "/",
            StatOp::Modulus => "%",
            StatOp::Less => "<",
            StatOp::LessEquals => "<=",
            StatOp::Greater => ">",
            StatOp::GreaterEquals => ">=",
            StatOp::Equals => "=",
            StatOp::NotEquals => "!=",
            StatOp::Min => "min()",
            StatOp::Max => "max()",
        }
    }
}

/// Combination of two stats that happens after per-group aggregation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl AggregateOp {
    pub fn symbol(self) -> &'static str {
        match self {
            AggregateOp::Add => "+",
            AggregateOp::Subtract => "-",
            AggregateOp::Multiply => "*",
            AggregateOp::Divide => "/",
        }
    }

    /// Combine two aggregated group values. Division by zero yields 0.
    pub fn combine(self, left: f64, right: f64) -> f64 {
        match self {
            AggregateOp::Add => left + right,
            AggregateOp::Subtract => left - right,
            AggregateOp::Multiply => left * right,
            AggregateOp::Divide => {
                if right == 0.0 {
                    0.0
                } else {
                    left / right
                }
            }
        }
    }
}

/// One engine instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Field(String),
    Literal(i64),
    Operator(StatOp),
    Exp,
    Abs,
    Cached,
    HasInt { field: String, value: i64 },
    HasStr { field: String, value: String },
    /// Back-reference to an already pushed stat, counted down from the slot below the one
    /// being pushed.
    Ref(usize),
    Count,
    FloatScale { field: String, mult: i64, add: i64 },
    Dynamic(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Field(name) => f.write_str(name),
            Token::Literal(v) => write!(f, "{v}"),
            Token::Operator(op) => f.write_str(op.symbol()),
            Token::Exp => f.write_str("exp"),
            Token::Abs => f.write_str("abs()"),
            Token::Cached => f.write_str("cached()"),
            Token::HasInt { field, value } => write!(f, "hasint {field}:{value}"),
            Token::HasStr { field, value } => write!(f, "hasstr {field}:{value}"),
            Token::Ref(offset) => write!(f, "ref {offset}"),
            Token::Count => f.write_str("count()"),
            Token::FloatScale { field, mult, add } => {
                write!(f, "floatscale {field} * {mult} + {add}")
            }
            Token::Dynamic(name) => write!(f, "dynamic {name}"),
        }
    }
}

/// Left fold of client-evaluable operands under one operator.
///
/// Only constructible through [`BinOpStat::new`], which rejects aggregate operands.
#[derive(Clone, Debug, PartialEq)]
pub struct BinOpStat {
    op: StatOp,
    operands: Vec<Stat>,
}

impl BinOpStat {
    pub fn new(op: StatOp, operands: Vec<Stat>) -> IqlResult<Self> {
        if operands.is_empty() {
            return Err(IqlError::EmptyOperands {
                op: op.symbol().to_string(),
            });
        }
        for operand in &operands {
            reject_aggregate(operand)?;
        }
        Ok(Self { op, operands })
    }

    pub fn op(&self) -> StatOp {
        self.op
    }

    pub fn operands(&self) -> &[Stat] {
        &self.operands
    }
}

/// Two stats pushed side by side and combined only once both are aggregated per group.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateBinOpStat {
    op: AggregateOp,
    left: Box<Stat>,
    right: Box<Stat>,
}

impl AggregateBinOpStat {
    pub fn new(op: AggregateOp, left: Stat, right: Stat) -> IqlResult<Self> {
        reject_aggregate(&left)?;
        reject_aggregate(&right)?;
        Ok(Self {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn op(&self) -> AggregateOp {
        self.op
    }

    pub fn left(&self) -> &Stat {
        &self.left
    }

    pub fn right(&self) -> &Stat {
        &self.right
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stat {
    IntField(String),
    DynamicMetric(DynamicMetric),
    BinOp(BinOpStat),
    AggregateBinOp(AggregateBinOpStat),
    Constant(i64),
    Exp(Box<Stat>),
    AbsoluteValue(Box<Stat>),
    Cached(Box<Stat>),
    HasInt { field: String, value: i64 },
    HasString { field: String, value: String },
    StatReference(SingleStatReference),
    Count,
    FloatScale { field: String, mult: i64, add: i64 },
}

impl Stat {
    pub fn int_field(name: impl Into<String>) -> Self {
        Stat::IntField(name.into())
    }

    pub fn constant(value: i64) -> Self {
        Stat::Constant(value)
    }

    pub fn count() -> Self {
        Stat::Count
    }

    pub fn has_int(field: impl Into<String>, value: i64) -> Self {
        Stat::HasInt {
            field: field.into(),
            value,
        }
    }

    pub fn has_string(field: impl Into<String>, value: impl Into<String>) -> Self {
        Stat::HasString {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn float_scale(field: impl Into<String>, mult: i64, add: i64) -> Self {
        Stat::FloatScale {
            field: field.into(),
            mult,
            add,
        }
    }

    pub fn exp(inner: Stat) -> IqlResult<Self> {
        reject_aggregate(&inner)?;
        Ok(Stat::Exp(Box::new(inner)))
    }

    pub fn abs(inner: Stat) -> IqlResult<Self> {
        reject_aggregate(&inner)?;
        Ok(Stat::AbsoluteValue(Box::new(inner)))
    }

    pub fn cached(inner: Stat) -> IqlResult<Self> {
        reject_aggregate(&inner)?;
        Ok(Stat::Cached(Box::new(inner)))
    }

    pub fn bin_op(op: StatOp, operands: Vec<Stat>) -> IqlResult<Self> {
        Ok(Stat::BinOp(BinOpStat::new(op, operands)?))
    }

    pub fn aggregate(op: AggregateOp, left: Stat, right: Stat) -> IqlResult<Self> {
        Ok(Stat::AggregateBinOp(AggregateBinOpStat::new(op, left, right)?))
    }

    /// A stat that reads a previously pushed stat. Aggregate references span two slots and
    /// cannot be read back per document.
    pub fn reference(reference: &StatReference) -> IqlResult<Self> {
        match reference {
            StatReference::Single(single) => Ok(Stat::StatReference(*single)),
            StatReference::Aggregate { op, .. } => Err(IqlError::AggregateOperand {
                op: op.symbol().to_string(),
            }),
        }
    }

    pub fn dynamic(metric: &DynamicMetric, registry: &MetricRegistry) -> IqlResult<Self> {
        registry.require_valid(metric)?;
        Ok(Stat::DynamicMetric(metric.clone()))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Stat::AggregateBinOp(_))
    }

    /// The first aggregate combinator anywhere in this tree, the root included.
    fn find_aggregate(&self) -> Option<&AggregateBinOpStat> {
        match self {
            Stat::AggregateBinOp(agg) => Some(agg),
            Stat::BinOp(bin) => bin.operands.iter().find_map(Stat::find_aggregate),
            Stat::Exp(inner) | Stat::AbsoluteValue(inner) | Stat::Cached(inner) => {
                inner.find_aggregate()
            }
            _ => None,
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        self.find_aggregate().is_some()
    }

    /// Number of evaluation stack slots the stat occupies once pushed.
    pub fn width(&self) -> usize {
        if self.is_aggregate() {
            2
        } else {
            1
        }
    }

    pub fn compile(&self, ctx: &CompileContext<'_>) -> IqlResult<Vec<Token>> {
        let mut out = Vec::new();
        self.compile_into(ctx, &mut out)?;
        Ok(out)
    }

    fn compile_into(&self, ctx: &CompileContext<'_>, out: &mut Vec<Token>) -> IqlResult<()> {
        match self {
            Stat::IntField(name) => out.push(Token::Field(name.clone())),
            Stat::DynamicMetric(metric) => {
                ctx.metrics.require_valid(metric)?;
                out.push(Token::Dynamic(metric.name().to_string()));
            }
            Stat::BinOp(bin) => {
                for (idx, operand) in bin.operands.iter().enumerate() {
                    operand.compile_into(ctx, out)?;
                    if idx > 0 {
                        out.push(Token::Operator(bin.op));
                    }
                }
            }
            Stat::AggregateBinOp(agg) => {
                agg.left.compile_into(ctx, out)?;
                agg.right.compile_into(ctx, out)?;
            }
            Stat::Constant(value) => out.push(Token::Literal(*value)),
            Stat::Exp(inner) => {
                reject_aggregate(inner)?;
                inner.compile_into(ctx, out)?;
                out.push(Token::Exp);
            }
            Stat::AbsoluteValue(inner) => {
                reject_aggregate(inner)?;
                inner.compile_into(ctx, out)?;
                out.push(Token::Abs);
            }
            Stat::Cached(inner) => {
                reject_aggregate(inner)?;
                inner.compile_into(ctx, out)?;
                out.push(Token::Cached);
            }
            Stat::HasInt { field, value } => out.push(Token::HasInt {
                field: field.clone(),
                value: *value,
            }),
            Stat::HasString { field, value } => out.push(Token::HasStr {
                field: field.clone(),
                value: value.clone(),
            }),
            Stat::StatReference(single) => {
                ctx.stack.require_valid_slot(single)?;
                // Recomputed at every use: pushes and pops since the reference was taken shift it.
                let offset = ctx
                    .depth
                    .checked_sub(single.depth() + 1)
                    .ok_or(IqlError::StaleReference {
                        depth: single.depth(),
                    })?;
                out.push(Token::Ref(offset));
            }
            Stat::Count => out.push(Token::Count),
            Stat::FloatScale { field, mult, add } => out.push(Token::FloatScale {
                field: field.clone(),
                mult: *mult,
                add: *add,
            }),
        }
        Ok(())
    }
}

/// Aggregate results only exist per group, so no per-document expression may take one as input.
fn reject_aggregate(operand: &Stat) -> IqlResult<()> {
    match operand.find_aggregate() {
        Some(agg) => Err(IqlError::AggregateOperand {
            op: agg.op.symbol().to_string(),
        }),
        None => Ok(()),
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stat::IntField(name) => write!(f, "int:{name}"),
            Stat::DynamicMetric(metric) => write!(f, "dynamic \"{}\"", metric.name()),
            Stat::BinOp(bin) => {
                f.write_str("(")?;
                for (idx, operand) in bin.operands.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " {} ", bin.op.symbol())?;
                    }
                    write!(f, "{operand}")?;
                }
                f.write_str(")")
            }
            Stat::AggregateBinOp(agg) => {
                write!(f, "({}) {} ({})", agg.left, agg.op.symbol(), agg.right)
            }
            Stat::Constant(value) => write!(f, "{value}"),
            Stat::Exp(inner) => write!(f, "exp({inner})"),
            Stat::AbsoluteValue(inner) => write!(f, "abs({inner})"),
            Stat::Cached(inner) => write!(f, "cached({inner})"),
            Stat::HasInt { field, value } => write!(f, "hasint:{field}:{value}"),
            Stat::HasString { field, value } => write!(f, "hasstr:{field}:{value}"),
            Stat::StatReference(single) => write!(f, "ref:{}", single.depth()),
            Stat::Count => f.write_str("count()"),
            Stat::FloatScale { field, mult, add } => write!(f, "floatscale:{field}*{mult}+{add}"),
        }
    }
}

/// Everything compilation reads from the session.
#[derive(Clone, Copy, Debug)]
pub struct CompileContext<'a> {
    depth: usize,
    stack: &'a StatStack,
    metrics: &'a MetricRegistry,
}

impl<'a> CompileContext<'a> {
    pub fn new(stack: &'a StatStack, metrics: &'a MetricRegistry) -> Self {
        Self {
            depth: stack.depth(),
            stack,
            metrics,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}
