//! AST for grug source files.
//!
//! Comments and empty lines are statements in their own right, and f32
//! literals keep their original spelling: the AST serializes back to the
//! exact source text (see `dump`).

use grug_core::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "not",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
        }
    }

    pub fn is_equality(self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::Ne)
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn symbol(self) -> &'static str {
        match self {
            LogicalOp::And => "and",
            LogicalOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    True,
    False,
    /// A plain string literal. The type checker reclassifies it to
    /// `Resource` or `Entity` when a callee demands it.
    StringLit(String),
    Resource(String),
    EntityRef(String),
    Identifier(String),
    I32(i32),
    F32 {
        value: f32,
        /// Original spelling, kept for the dumper.
        text: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Parenthesized(Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    /// Filled in by type propagation.
    pub result_type: Type,
    /// The precise type name (matters for custom id types), also filled in
    /// by type propagation.
    pub result_type_name: String,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Expr {
        Expr {
            kind,
            result_type: Type::Void,
            result_type_name: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VariableStatement {
    pub name: String,
    /// Present on declarations (`x: i32 = ...`), absent on reassignments.
    pub declared_type: Option<(Type, String)>,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Variable(VariableStatement),
    /// A call in statement position; the expression is always `Call`.
    Call(Expr),
    If {
        condition: Expr,
        then_body: Vec<Statement>,
        /// An `else if` chain is one nested `If` statement here.
        else_body: Vec<Statement>,
    },
    Return(Option<Expr>),
    While {
        condition: Expr,
        body: Vec<Statement>,
    },
    Break,
    Continue,
    EmptyLine,
    Comment(String),
}

#[derive(Debug, Clone)]
pub struct FnParam {
    pub name: String,
    pub ty: Type,
    pub type_name: String,
}

#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    pub ty: Type,
    pub type_name: String,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub struct OnFn {
    pub name: String,
    pub params: Vec<FnParam>,
    pub body: Vec<Statement>,
    /// Set by type propagation; decides whether the safe prologue arms the
    /// stack floor and the deadline.
    pub calls_helper_fn: bool,
    pub contains_while_loop: bool,
}

#[derive(Debug, Clone)]
pub struct HelperFn {
    pub name: String,
    pub params: Vec<FnParam>,
    pub return_type: Type,
    pub return_type_name: Option<String>,
    pub body: Vec<Statement>,
}

/// One top-level line group, in source order, so the file can be dumped
/// back. The indices point into the `GrugFileAst` vectors.
#[derive(Debug, Clone)]
pub enum TopLevel {
    GlobalVariable(usize),
    OnFn(usize),
    HelperFn(usize),
    EmptyLine,
    Comment(String),
}

#[derive(Debug, Clone, Default)]
pub struct GrugFileAst {
    pub globals: Vec<GlobalVariable>,
    pub on_fns: Vec<OnFn>,
    pub helper_fns: Vec<HelperFn>,
    pub layout: Vec<TopLevel>,
}

impl GrugFileAst {
    pub fn helper_fn(&self, name: &str) -> Option<&HelperFn> {
        self.helper_fns.iter().find(|f| f.name == name)
    }
}
