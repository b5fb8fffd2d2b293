//! Analytics SQL generation
//!
//! Turns a parsed expression plus program metadata into a PostgreSQL fragment
//! for the analytics event tables. The generator is dual-mode: Event mode
//! reads values off the current row (guarded by a stage check), Enrollment
//! mode fetches the latest value per enrollment through a correlated
//! subquery. Each mode is a separate [`EmissionStrategy`], picked once per
//! compile from the [`AnalyticsContext`], so reference emission never
//! branches on mode mid-walk.
//!
//! Identifier safety rests on the parser: every uid interpolated below has
//! already passed the 11-character shape check, and literals are rendered
//! with quotes doubled, so no user text reaches the SQL unchecked.

use chrono::NaiveDate;
use thiserror::Error;

use crate::ast::{Expr, ItemRef, Literal};
use crate::functions;
use crate::metadata::{
    AnalyticsPeriodBoundary, AnalyticsType, ProgramIndicator, ProgramMetadata, ValueType,
};
use crate::parser::{parse_expression, ParseError};

// =============================================================================
// ERRORS
// =============================================================================

/// Compilation failure. The generator never emits partial SQL: any unknown
/// identifier or misused function fails the whole expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("unknown data element '{id}'")]
    UnknownDataElement { id: String },

    #[error("unknown attribute '{id}'")]
    UnknownAttribute { id: String },

    #[error("unknown constant '{id}'")]
    UnknownConstant { id: String },

    #[error("unknown program variable '{name}'")]
    UnknownVariable { name: String },

    #[error("unsupported function 'd2:{name}'")]
    UnsupportedFunction { name: String },

    #[error("d2:{function} expects {expected} argument(s), found {found}")]
    WrongArgumentCount {
        function: String,
        expected: String,
        found: usize,
    },

    #[error("invalid argument to d2:{function}: {message}")]
    InvalidArgument { function: String, message: String },
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Requested SQL type of the compiled expression. Filters compile as
/// `Boolean`, value expressions as `Numeric`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDataType {
    Numeric,
    Boolean,
}

/// Everything the generator needs besides the expression itself: the mode,
/// the metadata to resolve references against, the reporting window, and the
/// boundaries that shape correlated subqueries.
#[derive(Debug, Clone)]
pub struct AnalyticsContext<'a> {
    pub mode: AnalyticsType,
    pub metadata: &'a ProgramMetadata,
    pub output_type: SqlDataType,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub alias: String,
    pub boundaries: Vec<AnalyticsPeriodBoundary>,
}

impl<'a> AnalyticsContext<'a> {
    pub fn new(
        mode: AnalyticsType,
        metadata: &'a ProgramMetadata,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Self {
        Self {
            mode,
            metadata,
            output_type: SqlDataType::Numeric,
            date_from,
            date_to,
            alias: "ax".to_string(),
            boundaries: ProgramIndicator::default_boundaries(),
        }
    }

    /// Build a context from an indicator definition and a reporting window.
    pub fn for_indicator(
        indicator: &ProgramIndicator,
        metadata: &'a ProgramMetadata,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Self {
        let mut ctx = Self::new(indicator.analytics_type, metadata, date_from, date_to);
        ctx.boundaries = indicator.effective_boundaries();
        ctx
    }

    pub fn with_output_type(mut self, output_type: SqlDataType) -> Self {
        self.output_type = output_type;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Name of the analytics event table for this program.
    pub fn event_table(&self) -> String {
        format!("analytics_event_{}", self.metadata.program)
    }

    /// Boundary predicates in declaration order.
    pub(crate) fn window_parts(&self) -> Vec<String> {
        self.boundaries
            .iter()
            .map(|b| {
                format!(
                    "{} {} cast( '{}' as date )",
                    b.target.column(),
                    b.boundary_type.sql_operator(),
                    b.boundary_date(self.date_from, self.date_to).format("%Y-%m-%d")
                )
            })
            .collect()
    }

    fn correlation(&self) -> String {
        format!("{}.enrollment = {}.enrollment", self.event_table(), self.alias)
    }
}

// =============================================================================
// PUBLIC ENTRY POINTS
// =============================================================================

/// Compile a parsed expression to SQL.
pub fn generate_sql(expr: &Expr, ctx: &AnalyticsContext) -> Result<String, CompileError> {
    tracing::debug!(mode = ?ctx.mode, program = %ctx.metadata.program, "compiling expression");
    let mut compiler = Compiler::new(ctx, expr.collect_item_refs());
    compiler.emit(expr)
}

/// Parse and compile a value expression.
pub fn compile_expression(text: &str, ctx: &AnalyticsContext) -> Result<String, CompileError> {
    let expr = parse_expression(text)?;
    generate_sql(&expr, ctx)
}

/// Parse and compile a filter; filters always compile with boolean output so
/// boolean-typed references coerce to `true`/`false`.
pub fn compile_filter(text: &str, ctx: &AnalyticsContext) -> Result<String, CompileError> {
    let expr = parse_expression(text)?;
    let ctx = ctx.clone().with_output_type(SqlDataType::Boolean);
    generate_sql(&expr, &ctx)
}

/// Render an expression with every reference replaced by its display name.
/// Unknown identifiers are reported, never echoed into the description.
pub fn describe_expression(text: &str, meta: &ProgramMetadata) -> Result<String, CompileError> {
    let expr = parse_expression(text)?;
    describe(&expr, meta)
}

/// Build a `"col" is not null or ...` clause over the distinct element and
/// attribute references of an expression, or `None` when it has no
/// references. Enrollment analytics tables name element columns by stage.
pub fn any_value_exists_clause(
    text: &str,
    mode: AnalyticsType,
) -> Result<Option<String>, ParseError> {
    let expr = parse_expression(text)?;
    let refs = expr.collect_item_refs();
    if refs.is_empty() {
        return Ok(None);
    }
    let clauses: Vec<String> = refs
        .iter()
        .map(|item| {
            let col = match item {
                ItemRef::DataElement { stage, element } => match mode {
                    AnalyticsType::Event => format!("\"{}\"", element),
                    AnalyticsType::Enrollment => format!("\"{}_{}\"", stage, element),
                },
                ItemRef::Attribute { id } => format!("\"{}\"", id),
            };
            format!("{} is not null", col)
        })
        .collect();
    Ok(Some(clauses.join(" or ")))
}

// =============================================================================
// EMISSION STRATEGIES
// =============================================================================

/// Raw reference forms for one analytics mode. A strategy is stateless; it
/// reads the window and table names off the context it is handed.
trait EmissionStrategy {
    fn data_element(&self, ctx: &AnalyticsContext, stage: &str, element: &str) -> String;

    fn event_date(&self, ctx: &AnalyticsContext, stage: &str) -> String;

    /// An event-table column for an event-scoped program variable,
    /// restricted to the given event statuses.
    fn event_column(&self, ctx: &AnalyticsContext, column: &str, statuses: &str) -> String;

    /// `d2:minValue`/`d2:maxValue` over a stage-scoped column.
    fn min_max(&self, ctx: &AnalyticsContext, aggregate: &str, stage: &str, column: &str)
        -> String;
}

/// Event mode: the current row is a single event; references read the row
/// directly, guarded by a stage check where one applies.
struct EventEmission;

impl EmissionStrategy for EventEmission {
    fn data_element(&self, ctx: &AnalyticsContext, stage: &str, element: &str) -> String {
        format!(
            "case when {}.\"ps\" = '{}' then \"{}\" else null end",
            ctx.alias, stage, element
        )
    }

    fn event_date(&self, _ctx: &AnalyticsContext, _stage: &str) -> String {
        "occurreddate".to_string()
    }

    fn event_column(&self, _ctx: &AnalyticsContext, column: &str, _statuses: &str) -> String {
        column.to_string()
    }

    fn min_max(
        &self,
        _ctx: &AnalyticsContext,
        _aggregate: &str,
        _stage: &str,
        column: &str,
    ) -> String {
        // one event per row, so min/max degenerate to the column itself
        column.to_string()
    }
}

/// Enrollment mode: references pull the latest value among the enrollment's
/// events through a correlated subquery bounded by the analytics window.
struct EnrollmentEmission;

impl EmissionStrategy for EnrollmentEmission {
    fn data_element(&self, ctx: &AnalyticsContext, stage: &str, element: &str) -> String {
        let col = format!("\"{}\"", element);
        latest_value(ctx, &col, &col, &format!("ps = '{}'", stage))
    }

    fn event_date(&self, ctx: &AnalyticsContext, stage: &str) -> String {
        latest_value(
            ctx,
            "occurreddate",
            "occurreddate",
            &format!("ps = '{}'", stage),
        )
    }

    fn event_column(&self, ctx: &AnalyticsContext, column: &str, statuses: &str) -> String {
        latest_value(ctx, column, column, &format!("psistatus in {}", statuses))
    }

    fn min_max(
        &self,
        ctx: &AnalyticsContext,
        aggregate: &str,
        stage: &str,
        column: &str,
    ) -> String {
        let mut parts = vec![ctx.correlation()];
        parts.extend(ctx.window_parts());
        parts.push(format!("ps = '{}'", stage));
        format!(
            "(select {}({}) from {} where {})",
            aggregate,
            column,
            ctx.event_table(),
            parts.join(" and ")
        )
    }
}

/// Latest non-null value of a column for the current enrollment, within the
/// boundary window, restricted by one extra predicate (stage or status).
fn latest_value(
    ctx: &AnalyticsContext,
    select_col: &str,
    non_null_col: &str,
    scope: &str,
) -> String {
    let mut parts = vec![
        ctx.correlation(),
        format!("{} is not null", non_null_col),
    ];
    parts.extend(ctx.window_parts());
    parts.push(scope.to_string());
    format!(
        "(select {} from {} where {} order by occurreddate desc limit 1 )",
        select_col,
        ctx.event_table(),
        parts.join(" and ")
    )
}

// =============================================================================
// COMPILER
// =============================================================================

/// Per-compile state. Holds the strategy for the context's mode, the
/// collected item references (for the synthetic count variables), and the
/// column override used while compiling a `d2:countIfCondition` template.
pub(crate) struct Compiler<'a> {
    ctx: &'a AnalyticsContext<'a>,
    strategy: &'static dyn EmissionStrategy,
    item_refs: Vec<ItemRef>,
    self_column: Option<(String, String)>,
    output_override: Option<SqlDataType>,
}

impl<'a> Compiler<'a> {
    fn new(ctx: &'a AnalyticsContext<'a>, item_refs: Vec<ItemRef>) -> Self {
        let strategy: &'static dyn EmissionStrategy = match ctx.mode {
            AnalyticsType::Event => &EventEmission,
            AnalyticsType::Enrollment => &EnrollmentEmission,
        };
        Self {
            ctx,
            strategy,
            item_refs,
            self_column: None,
            output_override: None,
        }
    }

    pub(crate) fn alias(&self) -> &str {
        &self.ctx.alias
    }

    pub(crate) fn event_table(&self) -> String {
        self.ctx.event_table()
    }

    pub(crate) fn window_parts(&self) -> Vec<String> {
        self.ctx.window_parts()
    }

    pub(crate) fn min_max_raw(&self, aggregate: &str, stage: &str, column: &str) -> String {
        self.strategy.min_max(self.ctx, aggregate, stage, column)
    }

    /// Check that a data element uid resolves before its text reaches SQL.
    pub(crate) fn require_element(&self, element: &str) -> Result<(), CompileError> {
        if self.ctx.metadata.element_value_type(element).is_none() {
            return Err(CompileError::UnknownDataElement {
                id: element.to_string(),
            });
        }
        Ok(())
    }

    fn output_type(&self) -> SqlDataType {
        self.output_override.unwrap_or(self.ctx.output_type)
    }

    // =========================================================================
    // EMISSION
    // =========================================================================

    /// Emit an expression with value coercion at every reference site.
    pub(crate) fn emit(&mut self, expr: &Expr) -> Result<String, CompileError> {
        match expr {
            Expr::Literal(lit) => Ok(literal_sql(lit)),

            Expr::Constant { id, .. } => self
                .ctx
                .metadata
                .constant_value(id)
                .map(|v| v.to_string())
                .ok_or_else(|| CompileError::UnknownConstant { id: id.clone() }),

            Expr::Variable { name, .. } => self.variable(name),

            Expr::DataElement { stage, element, .. } => {
                let value_type = self.ctx.metadata.element_value_type(element).ok_or_else(
                    || CompileError::UnknownDataElement {
                        id: element.clone(),
                    },
                )?;
                let raw = self.data_element_raw(stage, element);
                Ok(self.coerce(raw, value_type))
            }

            Expr::Attribute { id, .. } => {
                let value_type = self.ctx.metadata.attribute_value_type(id).ok_or_else(
                    || CompileError::UnknownAttribute { id: id.clone() },
                )?;
                let raw = format!("\"{}\"", id);
                Ok(self.coerce(raw, value_type))
            }

            Expr::EventDate { stage, .. } => Ok(self.strategy.event_date(self.ctx, stage)),

            Expr::Function { name, args, .. } => {
                let function = functions::lookup(name)
                    .ok_or_else(|| CompileError::UnsupportedFunction { name: name.clone() })?;
                function.apply(self, args)
            }

            Expr::Binary { op, left, right } => Ok(format!(
                "{} {} {}",
                self.emit(left)?,
                op.sql(),
                self.emit(right)?
            )),

            Expr::Unary { op, operand } => {
                Ok(format!("{}{}", op.sql(), self.emit(operand)?))
            }

            Expr::Group(inner) => Ok(format!("({})", self.emit(inner)?)),
        }
    }

    /// Emit the raw form of a reference (no coercion wrapper). Non-reference
    /// expressions fall back to normal emission.
    pub(crate) fn raw(&mut self, expr: &Expr) -> Result<String, CompileError> {
        match expr {
            Expr::DataElement { stage, element, .. } => {
                if self.ctx.metadata.element_value_type(element).is_none() {
                    return Err(CompileError::UnknownDataElement {
                        id: element.clone(),
                    });
                }
                Ok(self.data_element_raw(stage, element))
            }
            Expr::Attribute { id, .. } => {
                if self.ctx.metadata.attribute_value_type(id).is_none() {
                    return Err(CompileError::UnknownAttribute { id: id.clone() });
                }
                Ok(format!("\"{}\"", id))
            }
            Expr::EventDate { stage, .. } => Ok(self.strategy.event_date(self.ctx, stage)),
            Expr::Variable { name, .. } => self.variable(name),
            Expr::Group(inner) => Ok(format!("({})", self.raw(inner)?)),
            other => self.emit(other),
        }
    }

    /// Parse and compile a nested expression string with boolean output, for
    /// `d2:condition` and `d2:countIfCondition` templates.
    pub(crate) fn emit_boolean_text(&mut self, text: &str) -> Result<String, CompileError> {
        let expr = parse_expression(text)?;
        let saved = self.output_override;
        self.output_override = Some(SqlDataType::Boolean);
        let sql = self.emit(&expr);
        self.output_override = saved;
        sql
    }

    /// Same as [`emit_boolean_text`](Self::emit_boolean_text) but with the
    /// counted element rendered as a bare numeric column.
    pub(crate) fn emit_condition_template(
        &mut self,
        stage: &str,
        element: &str,
        template: &str,
    ) -> Result<String, CompileError> {
        let text = format!("#{{{}.{}}}{}", stage, element, template);
        let saved = self.self_column.take();
        self.self_column = Some((stage.to_string(), element.to_string()));
        let sql = self.emit_boolean_text(&text);
        self.self_column = saved;
        sql
    }

    fn data_element_raw(&self, stage: &str, element: &str) -> String {
        if let Some((s, e)) = &self.self_column {
            if s == stage && e == element {
                return format!("\"{}\"::numeric", element);
            }
        }
        self.strategy.data_element(self.ctx, stage, element)
    }

    // =========================================================================
    // PROGRAM VARIABLES
    // =========================================================================

    fn variable(&mut self, name: &str) -> Result<String, CompileError> {
        let sql = match name {
            "enrollment_date" => "enrollmentdate".to_string(),
            "incident_date" => "incidentdate".to_string(),
            "enrollment_status" | "program_status" => "pistatus".to_string(),
            "analytics_period_start" => {
                format!("cast( '{}' as date )", self.ctx.date_from.format("%Y-%m-%d"))
            }
            "analytics_period_end" => {
                format!("cast( '{}' as date )", self.ctx.date_to.format("%Y-%m-%d"))
            }
            "event_count" => "distinct event".to_string(),
            "enrollment_count" => "distinct enrollment".to_string(),
            "tei_count" => "distinct trackedentity".to_string(),
            "event_date" | "execution_date" => {
                self.strategy
                    .event_column(self.ctx, "occurreddate", "('ACTIVE','COMPLETED')")
            }
            "due_date" => self
                .strategy
                .event_column(self.ctx, "duedate", "('SCHEDULE','OVERDUE')"),
            "event_status" => self
                .strategy
                .event_column(self.ctx, "psistatus", "('ACTIVE','COMPLETED')"),
            "value_count" => self.synthetic_count("is not null")?,
            "zero_pos_value_count" => self.synthetic_count(">= 0")?,
            other => {
                return Err(CompileError::UnknownVariable {
                    name: other.to_string(),
                })
            }
        };
        Ok(sql)
    }

    /// `V{value_count}` and `V{zero_pos_value_count}`: one case-when term per
    /// distinct element/attribute reference in the whole expression.
    fn synthetic_count(&mut self, test: &str) -> Result<String, CompileError> {
        let refs = self.item_refs.clone();
        let mut terms = Vec::with_capacity(refs.len());
        for item in &refs {
            let raw = match item {
                ItemRef::DataElement { stage, element } => {
                    if self.ctx.metadata.element_value_type(element).is_none() {
                        return Err(CompileError::UnknownDataElement {
                            id: element.clone(),
                        });
                    }
                    self.data_element_raw(stage, element)
                }
                ItemRef::Attribute { id } => {
                    if self.ctx.metadata.attribute_value_type(id).is_none() {
                        return Err(CompileError::UnknownAttribute { id: id.clone() });
                    }
                    format!("\"{}\"", id)
                }
            };
            terms.push(format!("case when {} {} then 1 else 0 end", raw, test));
        }
        let sum = if terms.is_empty() {
            "0".to_string()
        } else {
            terms.join(" + ")
        };
        Ok(format!("nullif(cast(({}) as double precision),0)", sum))
    }

    // =========================================================================
    // COERCION
    // =========================================================================

    fn coerce(&self, raw: String, value_type: ValueType) -> String {
        if value_type.is_boolean() && self.output_type() == SqlDataType::Boolean {
            format!("coalesce({}::numeric!=0,false)", raw)
        } else if value_type.is_text() {
            format!("coalesce({},'')", raw)
        } else if value_type.is_date() {
            raw
        } else {
            format!("coalesce({}::numeric,0)", raw)
        }
    }
}

/// Render a literal to SQL. String quotes are doubled; numbers keep the
/// author's lexeme.
fn literal_sql(lit: &Literal) -> String {
    match lit {
        Literal::Number(n) => n.to_string(),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
        Literal::Boolean(b) => b.to_string(),
    }
}

// =============================================================================
// DESCRIPTIONS
// =============================================================================

fn describe(expr: &Expr, meta: &ProgramMetadata) -> Result<String, CompileError> {
    match expr {
        Expr::Literal(lit) => Ok(lit.to_expression_string()),
        Expr::Variable { name, .. } => Ok(name.replace('_', " ")),
        Expr::DataElement { element, .. } => meta
            .data_elements
            .get(element)
            .map(|de| de.name.clone())
            .ok_or_else(|| CompileError::UnknownDataElement {
                id: element.clone(),
            }),
        Expr::EventDate { stage, .. } => {
            let stage_name = meta
                .stage_names
                .get(stage)
                .cloned()
                .unwrap_or_else(|| stage.clone());
            Ok(format!("{} event date", stage_name))
        }
        Expr::Attribute { id, .. } => meta
            .attributes
            .get(id)
            .map(|at| at.name.clone())
            .ok_or_else(|| CompileError::UnknownAttribute { id: id.clone() }),
        Expr::Constant { id, .. } => meta
            .constants
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| CompileError::UnknownConstant { id: id.clone() }),
        Expr::Function { name, args, .. } => {
            let inner: Result<Vec<String>, CompileError> =
                args.iter().map(|a| describe(a, meta)).collect();
            Ok(format!("d2:{}({})", name, inner?.join(",")))
        }
        Expr::Binary { op, left, right } => Ok(format!(
            "{} {} {}",
            describe(left, meta)?,
            op.source(),
            describe(right, meta)?
        )),
        Expr::Unary { op, operand } => Ok(format!("{}{}", op.sql(), describe(operand, meta)?)),
        Expr::Group(inner) => Ok(format!("({})", describe(inner, meta)?)),
    }
}

// =============================================================================
// Tests
// =============================================================================
