//! Statement and expression forms of the mini language.
//!
//! One statement per line: either `name = expr` or a bare expression. The
//! value of the last bare expression is the program's value.

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign { target: String, value: Expr },
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Subscript {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    /// Call on a (possibly dotted) name. `method_call` is set for dotted
    /// callees.
    Call {
        function: String,
        method_call: bool,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
}
