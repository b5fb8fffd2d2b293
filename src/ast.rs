//! Expression AST for program indicator expressions and filters
//!
//! The AST is a closed sum type: every node kind the grammar can produce is a
//! variant of [`Expr`], and the SQL generator matches exhaustively, so adding
//! a node kind is a compile-time obligation everywhere it matters.
//!
//! Node kinds split into:
//! - **Literals**: terminal values (numbers, strings, booleans)
//! - **References**: program variables, data elements, attributes, constants,
//!   and the `PS_EVENTDATE:<stage>` shorthand - resolved against metadata at
//!   compile time, never mutated in place
//! - **Structure**: function calls, binary/unary operators, and explicit
//!   grouping (parentheses are preserved so generated SQL keeps the author's
//!   grouping)
//!
//! Trees are built once per expression string by the parser and are immutable
//! afterwards; no node holds a back reference.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// SPANS
// =============================================================================

/// Byte range of a node in the source expression, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

// =============================================================================
// LITERALS
// =============================================================================

/// A terminal value. Numbers keep their scale (`7.0` is not `7`) so that
/// generated SQL reproduces the author's literal exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Number(Decimal),
    String(String),
    Boolean(bool),
}

impl Literal {
    /// Render the literal back to expression source.
    pub fn to_expression_string(&self) -> String {
        match self {
            Literal::Number(n) => n.to_string(),
            Literal::String(s) => format!("'{}'", s),
            Literal::Boolean(b) => b.to_string(),
        }
    }
}

// =============================================================================
// OPERATORS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    And,
    Or,
}

impl BinaryOp {
    /// SQL rendering of the operator. `==` in expression source becomes `=`.
    pub fn sql(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    /// Expression-source rendering (differs from SQL only for equality).
    pub fn source(&self) -> &'static str {
        match self {
            BinaryOp::Equal => "==",
            other => other.sql(),
        }
    }

    /// True for comparison and logical operators, whose result is boolean.
    pub fn is_boolean(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessOrEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterOrEqual
                | BinaryOp::And
                | BinaryOp::Or
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Negate,
    Not,
}

impl UnaryOp {
    pub fn sql(&self) -> &'static str {
        match self {
            UnaryOp::Negate => "-",
            UnaryOp::Not => "not ",
        }
    }
}

// =============================================================================
// EXPR - THE CORE ENUM
// =============================================================================

/// A parsed expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Literal value - no resolution needed
    Literal(Literal),

    /// Program variable: `V{name}`
    /// Resolved against the variable table at compile time
    Variable { name: String, span: Span },

    /// Data element reference: `#{stageUid.elementUid}`
    DataElement {
        stage: String,
        element: String,
        span: Span,
    },

    /// Event date shorthand for a stage: `PS_EVENTDATE:stageUid`
    EventDate { stage: String, span: Span },

    /// Tracked entity attribute reference: `A{attributeUid}`
    Attribute { id: String, span: Span },

    /// Constant reference: `C{constantUid}`
    Constant { id: String, span: Span },

    /// Function call: `d2:name(arg, ...)` - only the `d2` namespace exists
    Function {
        name: String,
        args: Vec<Expr>,
        span: Span,
    },

    /// Binary operation with conventional precedence
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Unary operation: `-x`, `not x`
    Unary { op: UnaryOp, operand: Box<Expr> },

    /// Explicit parentheses, preserved through SQL generation
    Group(Box<Expr>),
}

impl Expr {
    // =========================================================================
    // CONSTRUCTORS
    // =========================================================================

    pub fn number(n: Decimal) -> Self {
        Expr::Literal(Literal::Number(n))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Expr::Literal(Literal::String(s.into()))
    }

    pub fn data_element(stage: impl Into<String>, element: impl Into<String>) -> Self {
        Expr::DataElement {
            stage: stage.into(),
            element: element.into(),
            span: Span::default(),
        }
    }

    pub fn attribute(id: impl Into<String>) -> Self {
        Expr::Attribute {
            id: id.into(),
            span: Span::default(),
        }
    }

    // =========================================================================
    // PREDICATES
    // =========================================================================

    /// Is this a reference that resolves to a per-row value (data element,
    /// attribute, event date, or program variable)?
    pub fn is_value_reference(&self) -> bool {
        matches!(
            self,
            Expr::DataElement { .. }
                | Expr::Attribute { .. }
                | Expr::EventDate { .. }
                | Expr::Variable { .. }
        )
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }

    // =========================================================================
    // EXTRACTORS
    // =========================================================================

    /// Get as string literal content
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Expr::Literal(Literal::String(s)) => Some(s),
            _ => None,
        }
    }

    // =========================================================================
    // TRAVERSAL
    // =========================================================================

    /// Walk the tree, visiting every node (parents before children).
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            }
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Unary { operand, .. } => operand.walk(visit),
            Expr::Group(inner) => inner.walk(visit),
            _ => {}
        }
    }

    /// Collect every data element and attribute reference, in source order,
    /// without duplicates. Used for `V{value_count}` style variables and the
    /// any-value-exists clause.
    pub fn collect_item_refs(&self) -> Vec<ItemRef> {
        let mut refs: Vec<ItemRef> = Vec::new();
        self.walk(&mut |node| {
            let item = match node {
                Expr::DataElement { stage, element, .. } => Some(ItemRef::DataElement {
                    stage: stage.clone(),
                    element: element.clone(),
                }),
                Expr::Attribute { id, .. } => Some(ItemRef::Attribute { id: id.clone() }),
                _ => None,
            };
            if let Some(item) = item {
                if !refs.contains(&item) {
                    refs.push(item);
                }
            }
        });
        refs
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Render the node back to expression source.
    pub fn to_expression_string(&self) -> String {
        match self {
            Expr::Literal(lit) => lit.to_expression_string(),
            Expr::Variable { name, .. } => format!("V{{{}}}", name),
            Expr::DataElement { stage, element, .. } => format!("#{{{}.{}}}", stage, element),
            Expr::EventDate { stage, .. } => format!("PS_EVENTDATE:{}", stage),
            Expr::Attribute { id, .. } => format!("A{{{}}}", id),
            Expr::Constant { id, .. } => format!("C{{{}}}", id),
            Expr::Function { name, args, .. } => {
                let inner: Vec<String> = args.iter().map(|a| a.to_expression_string()).collect();
                format!("d2:{}({})", name, inner.join(","))
            }
            Expr::Binary { op, left, right } => format!(
                "{} {} {}",
                left.to_expression_string(),
                op.source(),
                right.to_expression_string()
            ),
            Expr::Unary { op, operand } => {
                format!("{}{}", op.sql(), operand.to_expression_string())
            }
            Expr::Group(inner) => format!("({})", inner.to_expression_string()),
        }
    }
}

/// A data element or attribute occurrence within an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemRef {
    DataElement { stage: String, element: String },
    Attribute { id: String },
}

// =============================================================================
// Tests
// =============================================================================
