//! Abstract Syntax Tree consumed by the lowering pass and the tree-walker
//!
//! The tree arrives already parsed and type-checked. Nodes that need stable
//! identity across evaluations (await sites) carry a [`NodeId`]; source spans
//! are attached with [`Expression::Spanned`] and used for diagnostics only.

use crate::error::SourceSpan;
use crate::value::Str;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Stable node identity used as a cache key (per-await-site state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

static NEXT_NODE_ID: AtomicU32 = AtomicU32::new(1);

impl NodeId {
    pub fn fresh() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// A module: top-level statements evaluated in order
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub body: Vec<Statement>,
}

impl Module {
    pub fn new(body: Vec<Statement>) -> Self {
        Module { body }
    }
}

// ============ STATEMENTS ============

#[derive(Debug, Clone)]
pub enum Statement {
    Expression(Expression),
    While(WhileStatement),
    For(ForStatement),
    Break(BreakStatement),
    Continue(ContinueStatement),
    Return(ReturnStatement),
    Raise(RaiseStatement),
    Rethrow,
    FunctionDeclaration(FunctionDeclaration),
}

#[derive(Debug, Clone)]
pub struct WhileStatement {
    pub label: Option<Str>,
    pub condition: Expression,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub struct ForStatement {
    pub label: Option<Str>,
    pub pattern: Pattern,
    pub iterable: Expression,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub struct BreakStatement {
    pub label: Option<Str>,
    pub value: Option<Expression>,
}

#[derive(Debug, Clone)]
pub struct ContinueStatement {
    pub label: Option<Str>,
}

#[derive(Debug, Clone)]
pub struct ReturnStatement {
    pub value: Option<Expression>,
}

#[derive(Debug, Clone)]
pub struct RaiseStatement {
    pub value: Expression,
}

#[derive(Debug, Clone)]
pub struct FunctionDeclaration {
    pub name: Str,
    pub function: Arc<Lambda>,
}

/// A braced sequence of statements; evaluates to its last statement's value
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub body: Vec<Statement>,
}

impl Block {
    pub fn new(body: Vec<Statement>) -> Self {
        Block { body }
    }
}

// ============ EXPRESSIONS ============

#[derive(Debug, Clone)]
pub enum Expression {
    Literal(Literal),
    Identifier(Str),
    Unary(UnaryExpression),
    Binary(BinaryExpression),
    Logical(LogicalExpression),
    Assignment(AssignmentExpression),
    Block(Block),
    If(IfExpression),
    Loop(LoopExpression),
    Breakpoint(BreakpointExpression),
    Call(CallExpression),
    Member(MemberExpression),
    Index(IndexExpression),
    Lambda(Arc<Lambda>),
    Array(Vec<Expression>),
    StructLiteral(StructLiteral),
    Interpolation(Vec<Expression>),
    Range(RangeExpression),
    Match(MatchExpression),
    Rescue(RescueExpression),
    Ensure(EnsureExpression),
    OrElse(OrElseExpression),
    Propagate(Box<Expression>),
    Await(AwaitExpression),
    Spawn(SpawnExpression),
    /// Attaches a source span to the wrapped expression
    Spanned(SourceSpan, Box<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Nil,
    Void,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    String(Str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::BitAnd => ".&",
            BinaryOp::BitOr => ".|",
            BinaryOp::BitXor => ".^",
            BinaryOp::Shl => ".<<",
            BinaryOp::Shr => ".>>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub struct UnaryExpression {
    pub op: UnaryOp,
    pub operand: Box<Expression>,
}

#[derive(Debug, Clone)]
pub struct BinaryExpression {
    pub op: BinaryOp,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
}

#[derive(Debug, Clone)]
pub struct LogicalExpression {
    pub op: LogicalOp,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `:=` introduces a new binding in the current scope
    Declare,
    /// `=` updates an existing binding or defines one in the current scope
    Assign,
    /// `+=` and friends
    Compound(BinaryOp),
}

#[derive(Debug, Clone)]
pub enum AssignTarget {
    Name(Str),
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    Member {
        object: Box<Expression>,
        member: Str,
    },
    Pattern(Pattern),
}

#[derive(Debug, Clone)]
pub struct AssignmentExpression {
    pub op: AssignOp,
    pub target: AssignTarget,
    pub value: Box<Expression>,
}

#[derive(Debug, Clone)]
pub struct IfExpression {
    pub condition: Box<Expression>,
    pub consequent: Block,
    pub elsif: Vec<ElsifClause>,
    pub alternate: Option<Block>,
}

#[derive(Debug, Clone)]
pub struct ElsifClause {
    pub condition: Expression,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub struct LoopExpression {
    pub label: Option<Str>,
    pub body: Block,
}

/// Labeled block that `break 'label value` can exit early
#[derive(Debug, Clone)]
pub struct BreakpointExpression {
    pub label: Str,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub struct CallExpression {
    pub callee: Box<Expression>,
    pub arguments: Vec<Expression>,
}

#[derive(Debug, Clone)]
pub struct MemberExpression {
    pub object: Box<Expression>,
    pub member: Str,
    /// `?.` member access: a nil object short-circuits to nil
    pub safe: bool,
}

#[derive(Debug, Clone)]
pub struct IndexExpression {
    pub object: Box<Expression>,
    pub index: Box<Expression>,
}

#[derive(Debug, Clone)]
pub struct Lambda {
    pub name: Option<Str>,
    pub params: Vec<Str>,
    pub body: Expression,
}

#[derive(Debug, Clone)]
pub struct StructLiteral {
    pub name: Str,
    pub fields: Vec<(Str, Expression)>,
}

#[derive(Debug, Clone)]
pub struct RangeExpression {
    pub start: Box<Expression>,
    pub end: Box<Expression>,
    pub inclusive: bool,
}

#[derive(Debug, Clone)]
pub struct MatchClause {
    pub pattern: Pattern,
    pub guard: Option<Expression>,
    pub body: Expression,
}

#[derive(Debug, Clone)]
pub struct MatchExpression {
    pub subject: Box<Expression>,
    pub clauses: Vec<MatchClause>,
}

#[derive(Debug, Clone)]
pub struct RescueExpression {
    pub expression: Box<Expression>,
    pub clauses: Vec<MatchClause>,
}

#[derive(Debug, Clone)]
pub struct EnsureExpression {
    pub expression: Box<Expression>,
    pub cleanup: Block,
}

#[derive(Debug, Clone)]
pub struct OrElseExpression {
    pub expression: Box<Expression>,
    pub binding: Option<Str>,
    pub handler: Block,
}

#[derive(Debug, Clone)]
pub struct AwaitExpression {
    pub id: NodeId,
    /// Evaluates to an array of awaitable arms
    pub arms: Box<Expression>,
}

#[derive(Debug, Clone)]
pub struct SpawnExpression {
    pub body: Box<Expression>,
}

// ============ PATTERNS ============

#[derive(Debug, Clone)]
pub enum Pattern {
    Wildcard,
    Binding(Str),
    Literal(Literal),
    Struct {
        name: Option<Str>,
        fields: Vec<(Str, Pattern)>,
    },
    Array(Vec<Pattern>),
    /// Matches when the runtime type (or error kind) equals `type_name`
    Typed {
        type_name: Str,
        inner: Box<Pattern>,
    },
}

impl Pattern {
    pub fn binding(name: &str) -> Self {
        Pattern::Binding(name.into())
    }

    pub fn typed(type_name: &str, inner: Pattern) -> Self {
        Pattern::Typed {
            type_name: type_name.into(),
            inner: Box::new(inner),
        }
    }

    /// Names this pattern binds, in order
    pub fn bound_names(&self) -> Vec<Str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, out: &mut Vec<Str>) {
        match self {
            Pattern::Binding(name) => out.push(name.clone()),
            Pattern::Struct { fields, .. } => {
                for (_, p) in fields {
                    p.collect_names(out);
                }
            }
            Pattern::Array(items) => {
                for p in items {
                    p.collect_names(out);
                }
            }
            Pattern::Typed { inner, .. } => inner.collect_names(out),
            Pattern::Wildcard | Pattern::Literal(_) => {}
        }
    }
}

// ============ CONSTRUCTORS ============

impl Statement {
    pub fn expr(expression: Expression) -> Self {
        Statement::Expression(expression)
    }

    pub fn while_loop(condition: Expression, body: Vec<Statement>) -> Self {
        Statement::While(WhileStatement {
            label: None,
            condition,
            body: Block::new(body),
        })
    }

    pub fn for_in(name: &str, iterable: Expression, body: Vec<Statement>) -> Self {
        Statement::For(ForStatement {
            label: None,
            pattern: Pattern::binding(name),
            iterable,
            body: Block::new(body),
        })
    }

    /// Attach a label to a `while` or `for` statement
    pub fn labeled(self, label: &str) -> Self {
        match self {
            Statement::While(mut w) => {
                w.label = Some(label.into());
                Statement::While(w)
            }
            Statement::For(mut f) => {
                f.label = Some(label.into());
                Statement::For(f)
            }
            other => other,
        }
    }

    pub fn break_loop(label: Option<&str>, value: Option<Expression>) -> Self {
        Statement::Break(BreakStatement {
            label: label.map(Str::from),
            value,
        })
    }

    pub fn continue_loop(label: Option<&str>) -> Self {
        Statement::Continue(ContinueStatement {
            label: label.map(Str::from),
        })
    }

    pub fn return_value(value: Option<Expression>) -> Self {
        Statement::Return(ReturnStatement { value })
    }

    pub fn raise(value: Expression) -> Self {
        Statement::Raise(RaiseStatement { value })
    }

    pub fn function(name: &str, params: &[&str], body: Expression) -> Self {
        Statement::FunctionDeclaration(FunctionDeclaration {
            name: name.into(),
            function: Arc::new(Lambda {
                name: Some(name.into()),
                params: params.iter().map(|p| Str::from(*p)).collect(),
                body,
            }),
        })
    }
}

impl Expression {
    pub fn nil() -> Self {
        Expression::Literal(Literal::Nil)
    }

    pub fn void() -> Self {
        Expression::Literal(Literal::Void)
    }

    pub fn bool(b: bool) -> Self {
        Expression::Literal(Literal::Bool(b))
    }

    pub fn int(n: i64) -> Self {
        Expression::Literal(Literal::Int(n))
    }

    pub fn float(n: f64) -> Self {
        Expression::Literal(Literal::Float(n))
    }

    pub fn string(s: &str) -> Self {
        Expression::Literal(Literal::String(s.into()))
    }

    pub fn ident(name: &str) -> Self {
        Expression::Identifier(name.into())
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Expression::Binary(BinaryExpression {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn unary(op: UnaryOp, operand: Expression) -> Self {
        Expression::Unary(UnaryExpression {
            op,
            operand: Box::new(operand),
        })
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Expression::Logical(LogicalExpression {
            op: LogicalOp::And,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn or(left: Expression, right: Expression) -> Self {
        Expression::Logical(LogicalExpression {
            op: LogicalOp::Or,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn assignment(op: AssignOp, target: AssignTarget, value: Expression) -> Self {
        Expression::Assignment(AssignmentExpression {
            op,
            target,
            value: Box::new(value),
        })
    }

    pub fn declare(name: &str, value: Expression) -> Self {
        Self::assignment(AssignOp::Declare, AssignTarget::Name(name.into()), value)
    }

    pub fn assign(name: &str, value: Expression) -> Self {
        Self::assignment(AssignOp::Assign, AssignTarget::Name(name.into()), value)
    }

    pub fn compound(name: &str, op: BinaryOp, value: Expression) -> Self {
        Self::assignment(AssignOp::Compound(op), AssignTarget::Name(name.into()), value)
    }

    pub fn assign_index(object: Expression, index: Expression, value: Expression) -> Self {
        Self::assignment(
            AssignOp::Assign,
            AssignTarget::Index {
                object: Box::new(object),
                index: Box::new(index),
            },
            value,
        )
    }

    pub fn assign_member(object: Expression, member: &str, value: Expression) -> Self {
        Self::assignment(
            AssignOp::Assign,
            AssignTarget::Member {
                object: Box::new(object),
                member: member.into(),
            },
            value,
        )
    }

    pub fn destructure(pattern: Pattern, value: Expression) -> Self {
        Self::assignment(AssignOp::Declare, AssignTarget::Pattern(pattern), value)
    }

    pub fn block(body: Vec<Statement>) -> Self {
        Expression::Block(Block::new(body))
    }

    pub fn if_else(
        condition: Expression,
        consequent: Vec<Statement>,
        alternate: Option<Vec<Statement>>,
    ) -> Self {
        Expression::If(IfExpression {
            condition: Box::new(condition),
            consequent: Block::new(consequent),
            elsif: Vec::new(),
            alternate: alternate.map(Block::new),
        })
    }

    pub fn loop_expr(label: Option<&str>, body: Vec<Statement>) -> Self {
        Expression::Loop(LoopExpression {
            label: label.map(Str::from),
            body: Block::new(body),
        })
    }

    pub fn breakpoint(label: &str, body: Vec<Statement>) -> Self {
        Expression::Breakpoint(BreakpointExpression {
            label: label.into(),
            body: Block::new(body),
        })
    }

    pub fn call(callee: Expression, arguments: Vec<Expression>) -> Self {
        Expression::Call(CallExpression {
            callee: Box::new(callee),
            arguments,
        })
    }

    /// Call a function by name: `name(args...)`
    pub fn call_named(name: &str, arguments: Vec<Expression>) -> Self {
        Self::call(Self::ident(name), arguments)
    }

    pub fn member(object: Expression, member: &str) -> Self {
        Expression::Member(MemberExpression {
            object: Box::new(object),
            member: member.into(),
            safe: false,
        })
    }

    pub fn safe_member(object: Expression, member: &str) -> Self {
        Expression::Member(MemberExpression {
            object: Box::new(object),
            member: member.into(),
            safe: true,
        })
    }

    pub fn method_call(object: Expression, member: &str, arguments: Vec<Expression>) -> Self {
        Self::call(Self::member(object, member), arguments)
    }

    pub fn safe_call(object: Expression, member: &str, arguments: Vec<Expression>) -> Self {
        Self::call(Self::safe_member(object, member), arguments)
    }

    pub fn index(object: Expression, index: Expression) -> Self {
        Expression::Index(IndexExpression {
            object: Box::new(object),
            index: Box::new(index),
        })
    }

    pub fn lambda(params: &[&str], body: Expression) -> Self {
        Expression::Lambda(Arc::new(Lambda {
            name: None,
            params: params.iter().map(|p| Str::from(*p)).collect(),
            body,
        }))
    }

    pub fn array(items: Vec<Expression>) -> Self {
        Expression::Array(items)
    }

    pub fn struct_literal(name: &str, fields: Vec<(&str, Expression)>) -> Self {
        Expression::StructLiteral(StructLiteral {
            name: name.into(),
            fields: fields.into_iter().map(|(k, v)| (Str::from(k), v)).collect(),
        })
    }

    pub fn interpolate(parts: Vec<Expression>) -> Self {
        Expression::Interpolation(parts)
    }

    pub fn range(start: Expression, end: Expression, inclusive: bool) -> Self {
        Expression::Range(RangeExpression {
            start: Box::new(start),
            end: Box::new(end),
            inclusive,
        })
    }

    pub fn match_expr(subject: Expression, clauses: Vec<MatchClause>) -> Self {
        Expression::Match(MatchExpression {
            subject: Box::new(subject),
            clauses,
        })
    }

    pub fn rescue(expression: Expression, clauses: Vec<MatchClause>) -> Self {
        Expression::Rescue(RescueExpression {
            expression: Box::new(expression),
            clauses,
        })
    }

    pub fn ensure(expression: Expression, cleanup: Vec<Statement>) -> Self {
        Expression::Ensure(EnsureExpression {
            expression: Box::new(expression),
            cleanup: Block::new(cleanup),
        })
    }

    pub fn or_else(expression: Expression, binding: Option<&str>, handler: Vec<Statement>) -> Self {
        Expression::OrElse(OrElseExpression {
            expression: Box::new(expression),
            binding: binding.map(Str::from),
            handler: Block::new(handler),
        })
    }

    pub fn propagate(expression: Expression) -> Self {
        Expression::Propagate(Box::new(expression))
    }

    /// `await [arms...]` with a fresh site identity
    pub fn await_arms(arms: Vec<Expression>) -> Self {
        Self::await_expr(Expression::Array(arms))
    }

    pub fn await_expr(arms: Expression) -> Self {
        Expression::Await(AwaitExpression {
            id: NodeId::fresh(),
            arms: Box::new(arms),
        })
    }

    pub fn spawn(body: Expression) -> Self {
        Expression::Spawn(SpawnExpression {
            body: Box::new(body),
        })
    }

    pub fn spanned(self, line: u32, column: u32) -> Self {
        Expression::Spanned(SourceSpan { line, column }, Box::new(self))
    }
}

impl MatchClause {
    pub fn new(pattern: Pattern, guard: Option<Expression>, body: Expression) -> Self {
        MatchClause {
            pattern,
            guard,
            body,
        }
    }
}
