//! The `d2:` function library
//!
//! A static registry maps function names to arity bounds and an emit
//! function. Arity is checked before emission so every function body can
//! index its arguments directly. Emit functions receive the compiler so that
//! reference arguments render in the mode the surrounding expression uses.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::ast::Expr;
use crate::sqlgen::{CompileError, Compiler};

// =============================================================================
// REGISTRY
// =============================================================================

type EmitFn = fn(&mut Compiler, &[Expr]) -> Result<String, CompileError>;

pub struct D2Function {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    emit: EmitFn,
}

impl D2Function {
    pub(crate) fn apply(
        &self,
        compiler: &mut Compiler,
        args: &[Expr],
    ) -> Result<String, CompileError> {
        if args.len() < self.min_args || args.len() > self.max_args {
            let expected = if self.min_args == self.max_args {
                self.min_args.to_string()
            } else if self.max_args == usize::MAX {
                format!("{}+", self.min_args)
            } else {
                format!("{}..{}", self.min_args, self.max_args)
            };
            return Err(CompileError::WrongArgumentCount {
                function: self.name.to_string(),
                expected,
                found: args.len(),
            });
        }
        (self.emit)(compiler, args)
    }
}

static REGISTRY: Lazy<HashMap<&'static str, D2Function>> = Lazy::new(|| {
    let mut map = HashMap::new();
    let mut add = |name, min_args, max_args, emit| {
        map.insert(
            name,
            D2Function {
                name,
                min_args,
                max_args,
                emit,
            },
        );
    };
    add("hasValue", 1, 1, has_value as EmitFn);
    add("count", 1, 1, count);
    add("countIfValue", 2, 2, count_if_value);
    add("countIfCondition", 2, 2, count_if_condition);
    add("daysBetween", 2, 2, days_between);
    add("weeksBetween", 2, 2, weeks_between);
    add("monthsBetween", 2, 2, months_between);
    add("yearsBetween", 2, 2, years_between);
    add("minutesBetween", 2, 2, minutes_between);
    add("condition", 3, 3, condition);
    add("zing", 1, 1, zing);
    add("oizp", 1, 1, oizp);
    add("zpvc", 1, usize::MAX, zpvc);
    add("minValue", 1, 1, min_value);
    add("maxValue", 1, 1, max_value);
    add("relationshipCount", 0, 1, relationship_count);
    map
});

pub fn lookup(name: &str) -> Option<&'static D2Function> {
    REGISTRY.get(name)
}

// =============================================================================
// HELPERS
// =============================================================================

fn is_uid(s: &str) -> bool {
    s.len() == 11
        && s.starts_with(|c: char| c.is_ascii_alphabetic())
        && s.chars().all(|c| c.is_ascii_alphanumeric())
}

fn data_element_parts<'e>(
    compiler: &Compiler,
    function: &str,
    arg: &'e Expr,
) -> Result<(&'e str, &'e str), CompileError> {
    match arg {
        Expr::DataElement { stage, element, .. } => {
            compiler.require_element(element)?;
            Ok((stage, element))
        }
        _ => Err(CompileError::InvalidArgument {
            function: function.to_string(),
            message: "expected a #{stage.element} reference".to_string(),
        }),
    }
}

/// Stage plus quoted column for functions that also accept the event date.
fn stage_and_column<'e>(
    compiler: &Compiler,
    function: &str,
    arg: &'e Expr,
) -> Result<(&'e str, String), CompileError> {
    match arg {
        Expr::DataElement { stage, element, .. } => {
            compiler.require_element(element)?;
            Ok((stage, format!("\"{}\"", element)))
        }
        Expr::EventDate { stage, .. } => Ok((stage, "\"occurreddate\"".to_string())),
        _ => Err(CompileError::InvalidArgument {
            function: function.to_string(),
            message: "expected a data element or event date reference".to_string(),
        }),
    }
}

fn string_arg<'e>(function: &str, arg: &'e Expr) -> Result<&'e str, CompileError> {
    arg.as_string().ok_or_else(|| CompileError::InvalidArgument {
        function: function.to_string(),
        message: "expected a quoted string".to_string(),
    })
}

/// Correlated count over the enrollment's events for one element, with an
/// extra predicate from the count variant. The leading non-null check comes
/// from the shared latest-value machinery, so `d2:count` repeats it.
fn count_subquery(
    compiler: &mut Compiler,
    stage: &str,
    element: &str,
    predicate: String,
) -> String {
    let evt = compiler.event_table();
    let col = format!("\"{}\"", element);
    let mut parts = vec![
        format!("{}.enrollment = {}.enrollment", evt, compiler.alias()),
        format!("{} is not null", col),
        predicate,
    ];
    parts.extend(compiler.window_parts());
    parts.push(format!("ps = '{}'", stage));
    format!(
        "(select count({}) from {} where {})",
        col,
        evt,
        parts.join(" and ")
    )
}

// =============================================================================
// VALUE TESTS AND COUNTS
// =============================================================================

fn has_value(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    Ok(format!("({} is not null)", compiler.raw(&args[0])?))
}

fn count(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let (stage, element) = data_element_parts(compiler, "count", &args[0])?;
    let predicate = format!("\"{}\" is not null", element);
    Ok(count_subquery(compiler, stage, element, predicate))
}

fn count_if_value(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let (stage, element) = data_element_parts(compiler, "countIfValue", &args[0])?;
    let value = compiler.emit(&args[1])?;
    let predicate = format!("\"{}\" = {}", element, value);
    Ok(count_subquery(compiler, stage, element, predicate))
}

fn count_if_condition(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let (stage, element) = data_element_parts(compiler, "countIfCondition", &args[0])?;
    let template = string_arg("countIfCondition", &args[1])?;
    let (stage, element) = (stage.to_string(), element.to_string());
    let predicate = compiler.emit_condition_template(&stage, &element, template)?;
    Ok(count_subquery(compiler, &stage, &element, predicate))
}

// =============================================================================
// DATE ARITHMETIC
// =============================================================================

fn days_between(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let a = compiler.raw(&args[0])?;
    let b = compiler.raw(&args[1])?;
    Ok(format!("(cast({} as date) - cast({} as date))", b, a))
}

fn weeks_between(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let a = compiler.raw(&args[0])?;
    let b = compiler.raw(&args[1])?;
    Ok(format!("((cast({} as date) - cast({} as date)) / 7)", b, a))
}

fn months_between(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let a = compiler.raw(&args[0])?;
    let b = compiler.raw(&args[1])?;
    Ok(format!(
        "((date_part('year',age(cast({b} as date), cast({a} as date)))) * 12 + \
         date_part('month',age(cast({b} as date), cast({a} as date))))",
        a = a,
        b = b
    ))
}

fn years_between(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let a = compiler.raw(&args[0])?;
    let b = compiler.raw(&args[1])?;
    Ok(format!(
        "(date_part('year',age(cast({} as date), cast({} as date))))",
        b, a
    ))
}

fn minutes_between(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let a = compiler.raw(&args[0])?;
    let b = compiler.raw(&args[1])?;
    Ok(format!(
        "(extract(epoch from (cast({} as timestamp) - cast({} as timestamp))) / 60)",
        b, a
    ))
}

// =============================================================================
// CONDITIONALS AND NUMERIC SHAPING
// =============================================================================

fn condition(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let test = string_arg("condition", &args[0])?.to_string();
    let test_sql = compiler.emit_boolean_text(&test)?;
    let then_sql = compiler.emit(&args[1])?;
    let else_sql = compiler.emit(&args[2])?;
    Ok(format!(
        "case when ({}) then {} else {} end",
        test_sql, then_sql, else_sql
    ))
}

fn zing(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    Ok(format!("greatest(0,{})", compiler.emit(&args[0])?))
}

fn oizp(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    Ok(format!(
        "coalesce(case when {} >= 0 then 1 else 0 end, 0)",
        compiler.raw(&args[0])?
    ))
}

fn zpvc(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    let mut terms = Vec::with_capacity(args.len());
    for arg in args {
        terms.push(format!(
            "case when {} >= 0 then 1 else 0 end",
            compiler.raw(arg)?
        ));
    }
    Ok(format!(
        "nullif(cast(({}) as double precision),0)",
        terms.join(" + ")
    ))
}

// =============================================================================
// AGGREGATES
// =============================================================================

fn min_value(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    min_max_value(compiler, args, "min", "minValue")
}

fn max_value(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    min_max_value(compiler, args, "max", "maxValue")
}

fn min_max_value(
    compiler: &mut Compiler,
    args: &[Expr],
    aggregate: &str,
    function: &str,
) -> Result<String, CompileError> {
    let (stage, column) = stage_and_column(compiler, function, &args[0])?;
    Ok(compiler.min_max_raw(aggregate, stage, &column))
}

fn relationship_count(compiler: &mut Compiler, args: &[Expr]) -> Result<String, CompileError> {
    match args.first() {
        None => Ok(format!(
            "(select sum(relationship_count) from analytics_rs_relationship arr \
             where arr.trackedentityid = {}.trackedentity)",
            compiler.alias()
        )),
        Some(arg) => {
            let uid = string_arg("relationshipCount", arg)?;
            if !is_uid(uid) {
                return Err(CompileError::InvalidArgument {
                    function: "relationshipCount".to_string(),
                    message: format!("'{}' is not a valid relationship type uid", uid),
                });
            }
            Ok(format!(
                "(select relationship_count from analytics_rs_relationship arr \
                 where arr.trackedentityid = {}.trackedentity and \
                 relationshiptypeuid = '{}')",
                compiler.alias(),
                uid
            ))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        AnalyticsType, Attribute, Constant, DataElement, ProgramMetadata, ValueType,
    };
    use crate::sqlgen::{compile_expression, AnalyticsContext};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const EVT: &str = "analytics_event_Program000A";
    const WINDOW_SQL: &str = "occurreddate < cast( '2020-02-01' as date ) \
                              and occurreddate >= cast( '2020-01-01' as date )";

    fn meta() -> ProgramMetadata {
        let mut m = ProgramMetadata::new("Program000A");
        for (uid, vt) in [
            ("DataElmentA", ValueType::Number),
            ("DataElmentD", ValueType::Date),
            ("DataElmentE", ValueType::Text),
        ] {
            m.data_elements.insert(
                uid.to_string(),
                DataElement {
                    name: uid.to_string(),
                    value_type: vt,
                },
            );
        }
        m.attributes.insert(
            "Attribute0A".to_string(),
            Attribute {
                name: "Age".to_string(),
                value_type: ValueType::Number,
            },
        );
        m.constants.insert(
            "Constant00A".to_string(),
            Constant {
                name: "Half".to_string(),
                value: Decimal::from_str("0.5").unwrap(),
            },
        );
        m
    }

    fn ctx(m: &ProgramMetadata, mode: AnalyticsType) -> AnalyticsContext<'_> {
        AnalyticsContext::new(
            mode,
            m,
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2020, 1, 31).unwrap(),
        )
    }

    #[test]
    fn test_has_value_event_mode() {
        let m = meta();
        let sql =
            compile_expression("d2:hasValue(#{ProgrmStagA.DataElmentA})", &ctx(&m, AnalyticsType::Event))
                .unwrap();
        assert_eq!(
            sql,
            "(case when ax.\"ps\" = 'ProgrmStagA' then \"DataElmentA\" else null end \
             is not null)"
        );
    }

    #[test]
    fn test_has_value_enrollment_mode_wraps_subquery() {
        let m = meta();
        let sql = compile_expression(
            "d2:hasValue(#{ProgrmStagA.DataElmentA})",
            &ctx(&m, AnalyticsType::Enrollment),
        )
        .unwrap();
        assert!(sql.starts_with("((select \"DataElmentA\" from"), "sql: {}", sql);
        assert!(sql.ends_with("is not null)"), "sql: {}", sql);
    }

    #[test]
    fn test_count_repeats_non_null_predicate() {
        let m = meta();
        let sql = compile_expression(
            "d2:count(#{ProgrmStagA.DataElmentA})",
            &ctx(&m, AnalyticsType::Enrollment),
        )
        .unwrap();
        assert_eq!(
            sql,
            format!(
                "(select count(\"DataElmentA\") from {EVT} where {EVT}.enrollment = \
                 ax.enrollment and \"DataElmentA\" is not null and \"DataElmentA\" is \
                 not null and {WINDOW_SQL} and ps = 'ProgrmStagA')"
            )
        );
    }

    #[test]
    fn test_count_same_shape_in_event_mode() {
        let m = meta();
        let event = compile_expression(
            "d2:count(#{ProgrmStagA.DataElmentA})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        let enrollment = compile_expression(
            "d2:count(#{ProgrmStagA.DataElmentA})",
            &ctx(&m, AnalyticsType::Enrollment),
        )
        .unwrap();
        assert_eq!(event, enrollment);
    }

    #[test]
    fn test_count_if_value() {
        let m = meta();
        let sql = compile_expression(
            "d2:countIfValue(#{ProgrmStagA.DataElmentA},10)",
            &ctx(&m, AnalyticsType::Enrollment),
        )
        .unwrap();
        assert!(sql.contains("and \"DataElmentA\" = 10 and"), "sql: {}", sql);
    }

    #[test]
    fn test_count_if_condition_parses_template() {
        let m = meta();
        let sql = compile_expression(
            "d2:countIfCondition(#{ProgrmStagA.DataElmentA},'< 0')",
            &ctx(&m, AnalyticsType::Enrollment),
        )
        .unwrap();
        assert!(
            sql.contains("and \"DataElmentA\"::numeric < 0 and"),
            "sql: {}",
            sql
        );
    }

    #[test]
    fn test_days_between_subtracts_first_from_second() {
        let m = meta();
        let sql = compile_expression(
            "d2:daysBetween(V{enrollment_date},V{event_date})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(
            sql,
            "(cast(occurreddate as date) - cast(enrollmentdate as date))"
        );
    }

    #[test]
    fn test_weeks_between() {
        let m = meta();
        let sql = compile_expression(
            "d2:weeksBetween(V{enrollment_date},V{event_date})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(
            sql,
            "((cast(occurreddate as date) - cast(enrollmentdate as date)) / 7)"
        );
    }

    #[test]
    fn test_months_between() {
        let m = meta();
        let sql = compile_expression(
            "d2:monthsBetween(V{enrollment_date},V{event_date})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(
            sql,
            "((date_part('year',age(cast(occurreddate as date), \
             cast(enrollmentdate as date)))) * 12 + \
             date_part('month',age(cast(occurreddate as date), \
             cast(enrollmentdate as date))))"
        );
    }

    #[test]
    fn test_years_between() {
        let m = meta();
        let sql = compile_expression(
            "d2:yearsBetween(V{incident_date},V{enrollment_date})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(
            sql,
            "(date_part('year',age(cast(enrollmentdate as date), \
             cast(incidentdate as date))))"
        );
    }

    #[test]
    fn test_minutes_between() {
        let m = meta();
        let sql = compile_expression(
            "d2:minutesBetween(V{enrollment_date},V{event_date})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(
            sql,
            "(extract(epoch from (cast(occurreddate as timestamp) - \
             cast(enrollmentdate as timestamp))) / 60)"
        );
    }

    #[test]
    fn test_condition_compiles_template_as_boolean() {
        let m = meta();
        let sql = compile_expression(
            "d2:condition('#{ProgrmStagA.DataElmentA} > 3',10,5)",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(
            sql,
            "case when (coalesce(case when ax.\"ps\" = 'ProgrmStagA' then \
             \"DataElmentA\" else null end::numeric,0) > 3) then 10 else 5 end"
        );
    }

    #[test]
    fn test_zing_clamps_at_zero() {
        let m = meta();
        let sql = compile_expression(
            "d2:zing(A{Attribute0A})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(sql, "greatest(0,coalesce(\"Attribute0A\"::numeric,0))");
    }

    #[test]
    fn test_oizp_uses_raw_form() {
        let m = meta();
        let sql = compile_expression(
            "d2:oizp(A{Attribute0A})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(
            sql,
            "coalesce(case when \"Attribute0A\" >= 0 then 1 else 0 end, 0)"
        );
    }

    #[test]
    fn test_zpvc_sums_case_terms() {
        let m = meta();
        let sql = compile_expression(
            "d2:zpvc(A{Attribute0A},#{ProgrmStagA.DataElmentA})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(
            sql,
            "nullif(cast((case when \"Attribute0A\" >= 0 then 1 else 0 end + \
             case when case when ax.\"ps\" = 'ProgrmStagA' then \"DataElmentA\" \
             else null end >= 0 then 1 else 0 end) as double precision),0)"
        );
    }

    #[test]
    fn test_min_value_event_mode_is_bare_column() {
        let m = meta();
        let sql = compile_expression(
            "d2:minValue(#{ProgrmStagA.DataElmentA})",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(sql, "\"DataElmentA\"");

        let sql = compile_expression(
            "d2:maxValue(PS_EVENTDATE:ProgrmStagA)",
            &ctx(&m, AnalyticsType::Event),
        )
        .unwrap();
        assert_eq!(sql, "\"occurreddate\"");
    }

    #[test]
    fn test_min_value_enrollment_aggregates() {
        let m = meta();
        let sql = compile_expression(
            "d2:minValue(#{ProgrmStagA.DataElmentA})",
            &ctx(&m, AnalyticsType::Enrollment),
        )
        .unwrap();
        assert_eq!(
            sql,
            format!(
                "(select min(\"DataElmentA\") from {EVT} where {EVT}.enrollment = \
                 ax.enrollment and {WINDOW_SQL} and ps = 'ProgrmStagA')"
            )
        );
    }

    #[test]
    fn test_relationship_count_total_and_typed() {
        let m = meta();
        let c = ctx(&m, AnalyticsType::Event);
        assert_eq!(
            compile_expression("d2:relationshipCount()", &c).unwrap(),
            "(select sum(relationship_count) from analytics_rs_relationship arr \
             where arr.trackedentityid = ax.trackedentity)"
        );
        assert_eq!(
            compile_expression("d2:relationshipCount('RelatnTypeA')", &c).unwrap(),
            "(select relationship_count from analytics_rs_relationship arr \
             where arr.trackedentityid = ax.trackedentity and \
             relationshiptypeuid = 'RelatnTypeA')"
        );
    }

    #[test]
    fn test_relationship_count_rejects_bad_uid() {
        let m = meta();
        assert!(matches!(
            compile_expression(
                "d2:relationshipCount('nope')",
                &ctx(&m, AnalyticsType::Event)
            ),
            Err(CompileError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_unknown_function() {
        let m = meta();
        assert_eq!(
            compile_expression("d2:fake(1)", &ctx(&m, AnalyticsType::Event)),
            Err(CompileError::UnsupportedFunction {
                name: "fake".to_string()
            })
        );
    }

    #[test]
    fn test_wrong_argument_count() {
        let m = meta();
        assert_eq!(
            compile_expression(
                "d2:daysBetween(V{enrollment_date})",
                &ctx(&m, AnalyticsType::Event)
            ),
            Err(CompileError::WrongArgumentCount {
                function: "daysBetween".to_string(),
                expected: "2".to_string(),
                found: 1
            })
        );
    }

    #[test]
    fn test_count_rejects_unknown_element() {
        let m = meta();
        for mode in [AnalyticsType::Event, AnalyticsType::Enrollment] {
            assert_eq!(
                compile_expression("d2:count(#{ProgrmStagA.NoSuchElemZ})", &ctx(&m, mode)),
                Err(CompileError::UnknownDataElement {
                    id: "NoSuchElemZ".to_string()
                })
            );
        }
    }

    #[test]
    fn test_count_if_value_rejects_unknown_element() {
        let m = meta();
        assert_eq!(
            compile_expression(
                "d2:countIfValue(#{ProgrmStagA.NoSuchElemZ},10)",
                &ctx(&m, AnalyticsType::Enrollment)
            ),
            Err(CompileError::UnknownDataElement {
                id: "NoSuchElemZ".to_string()
            })
        );
    }

    #[test]
    fn test_count_if_condition_rejects_unknown_element() {
        let m = meta();
        assert_eq!(
            compile_expression(
                "d2:countIfCondition(#{ProgrmStagA.NoSuchElemZ},'> 0')",
                &ctx(&m, AnalyticsType::Enrollment)
            ),
            Err(CompileError::UnknownDataElement {
                id: "NoSuchElemZ".to_string()
            })
        );
    }

    #[test]
    fn test_min_max_value_reject_unknown_element() {
        let m = meta();
        for text in [
            "d2:minValue(#{ProgrmStagA.NoSuchElemZ})",
            "d2:maxValue(#{ProgrmStagA.NoSuchElemZ})",
        ] {
            for mode in [AnalyticsType::Event, AnalyticsType::Enrollment] {
                assert_eq!(
                    compile_expression(text, &ctx(&m, mode)),
                    Err(CompileError::UnknownDataElement {
                        id: "NoSuchElemZ".to_string()
                    })
                );
            }
        }
    }

    #[test]
    fn test_count_rejects_non_reference_argument() {
        let m = meta();
        assert!(matches!(
            compile_expression("d2:count(5)", &ctx(&m, AnalyticsType::Event)),
            Err(CompileError::InvalidArgument { .. })
        ));
    }
}
