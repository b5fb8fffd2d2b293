//! indicator-core: program indicator expression compiler and category
//! mapping resolver
//!
//! This crate contains the pure compilation logic with NO database
//! dependencies:
//! - Expression AST (Expr, Literal, operators, spans)
//! - Nom-based expression parser
//! - Read-only metadata model (programs, value types, boundaries)
//! - d2: function registry
//! - Dual-mode (event/enrollment) analytics SQL generator
//! - Category mapping resolver and validator
//!
//! Query assembly and execution stay with the caller: metadata arrives
//! pre-fetched, and compiled SQL fragments leave as strings.

pub mod ast;
pub mod functions;
pub mod mapping;
pub mod metadata;
pub mod parser;
pub mod sqlgen;

// Re-export commonly used types
pub use ast::{BinaryOp, Expr, ItemRef, Literal, Span, UnaryOp};
pub use mapping::{
    compile_option_filter, resolve_category_mappings, validate_category_mappings,
    validate_for_indicator, ConflictError, ProgramCategoryMapping, ProgramCategoryOptionMapping,
    ResolvedCategoryMapping,
};
pub use metadata::{
    AnalyticsPeriodBoundary, AnalyticsType, BoundaryTarget, BoundaryType, PeriodType,
    ProgramIndicator, ProgramMetadata, ValueType,
};
pub use parser::{parse_expression, ParseError};
pub use sqlgen::{
    any_value_exists_clause, compile_expression, compile_filter, describe_expression,
    generate_sql, AnalyticsContext, CompileError, SqlDataType,
};
