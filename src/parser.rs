//! Nom-based parser for the program indicator expression language
//!
//! One grammar serves three consumers: indicator expressions, indicator
//! filters, and category option mapping filters. Parsing is a pure function -
//! the same text always yields a structurally identical AST and no state
//! survives a call.
//!
//! Grammar summary:
//!
//! ```text
//! expression  := or
//! or          := and (("or" | "||") and)*
//! and         := comparison (("and" | "&&") comparison)*
//! comparison  := additive (("<" | "<=" | ">" | ">=" | "==" | "!=") additive)*
//! additive    := multiplicative (("+" | "-") multiplicative)*
//! multiplicative := unary (("*" | "/" | "%") unary)*
//! unary       := ("-" | "!" | "not") unary | primary
//! primary     := literal | reference | function | "(" expression ")"
//! reference   := "V{" name "}" | "#{" uid "." uid "}" | "A{" uid "}"
//!              | "C{" uid "}" | "PS_EVENTDATE:" uid
//! function    := "d2:" ident "(" [expression ("," expression)*] ")"
//! ```
//!
//! A `uid` is strictly one letter plus ten alphanumerics. Every identifier
//! the generator later interpolates into SQL has passed this check, which is
//! the crate's injection-safety whitelist for reference text.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_while, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map, opt, recognize, value, verify},
    error::{ParseError as NomParseError, VerboseError},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;

use crate::ast::{BinaryOp, Expr, Literal, Span, UnaryOp};

// =============================================================================
// Public API
// =============================================================================

/// Error for malformed expression text, pointing at the offending input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed expression at position {position}: '{snippet}'")]
pub struct ParseError {
    /// Byte offset into the source where parsing failed
    pub position: usize,
    /// The offending substring (truncated), or "end of input"
    pub snippet: String,
}

impl ParseError {
    fn at(source: &str, remaining: &str) -> Self {
        let position = source.len() - remaining.len();
        let snippet = if remaining.is_empty() {
            "end of input".to_string()
        } else {
            remaining.chars().take(24).collect()
        };
        ParseError { position, snippet }
    }
}

/// Parse a complete expression or filter.
///
/// Never silently drops input: trailing text that is not part of the grammar
/// is an error.
pub fn parse_expression(input: &str) -> Result<Expr, ParseError> {
    match all_consuming(delimited(
        multispace0::<_, VerboseError<&str>>,
        |i| expression(i, input),
        multispace0,
    ))(input)
    {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let remaining = e.errors.first().map(|(i, _)| *i).unwrap_or("");
            Err(ParseError::at(input, remaining))
        }
        Err(nom::Err::Incomplete(_)) => Err(ParseError {
            position: input.len(),
            snippet: "end of input".to_string(),
        }),
    }
}

// =============================================================================
// Precedence levels
// =============================================================================

fn expression<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    or_expr(input, source)
}

fn fold_binary(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |left, (op, right)| Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

fn or_expr<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (input, first) = and_expr(input, source)?;
    let (input, rest) = many0(pair(
        preceded(
            multispace0,
            alt((value(BinaryOp::Or, tag("||")), value(BinaryOp::Or, word("or")))),
        ),
        preceded(multispace0, |i| and_expr(i, source)),
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn and_expr<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (input, first) = comparison(input, source)?;
    let (input, rest) = many0(pair(
        preceded(
            multispace0,
            alt((value(BinaryOp::And, tag("&&")), value(BinaryOp::And, word("and")))),
        ),
        preceded(multispace0, |i| comparison(i, source)),
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn comparison<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (input, first) = additive(input, source)?;
    let (input, rest) = many0(pair(
        preceded(
            multispace0,
            alt((
                value(BinaryOp::LessOrEqual, tag("<=")),
                value(BinaryOp::GreaterOrEqual, tag(">=")),
                value(BinaryOp::Equal, tag("==")),
                value(BinaryOp::NotEqual, tag("!=")),
                value(BinaryOp::Less, tag("<")),
                value(BinaryOp::Greater, tag(">")),
            )),
        ),
        preceded(multispace0, |i| additive(i, source)),
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn additive<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (input, first) = multiplicative(input, source)?;
    let (input, rest) = many0(pair(
        preceded(
            multispace0,
            alt((
                value(BinaryOp::Add, char('+')),
                value(BinaryOp::Subtract, char('-')),
            )),
        ),
        preceded(multispace0, |i| multiplicative(i, source)),
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn multiplicative<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (input, first) = unary(input, source)?;
    let (input, rest) = many0(pair(
        preceded(
            multispace0,
            alt((
                value(BinaryOp::Multiply, char('*')),
                value(BinaryOp::Divide, char('/')),
                value(BinaryOp::Modulo, char('%')),
            )),
        ),
        preceded(multispace0, |i| unary(i, source)),
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn unary<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (input, op) = opt(preceded(
        multispace0,
        alt((
            value(UnaryOp::Negate, char('-')),
            value(UnaryOp::Not, char('!')),
            value(UnaryOp::Not, word("not")),
        )),
    ))(input)?;
    match op {
        Some(op) => {
            let (input, operand) = unary(input, source)?;
            Ok((
                input,
                Expr::Unary {
                    op,
                    operand: Box::new(operand),
                },
            ))
        }
        None => primary(input, source),
    }
}

fn primary<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (input, _) = multispace0(input)?;
    alt((
        |i| function_call(i, source),
        |i| event_date(i, source),
        |i| variable(i, source),
        |i| data_element(i, source),
        |i| attribute(i, source),
        |i| constant(i, source),
        map(boolean_literal, |b| Expr::Literal(Literal::Boolean(b))),
        string_literal,
        number_literal,
        map(
            delimited(
                char('('),
                delimited(multispace0, |i| expression(i, source), multispace0),
                char(')'),
            ),
            |e| Expr::Group(Box::new(e)),
        ),
    ))(input)
}

// =============================================================================
// Terminals
// =============================================================================

/// Keyword that must not run into a longer identifier (`or` vs `org`).
fn word<'a, E: NomParseError<&'a str>>(
    kw: &'static str,
) -> impl Fn(&'a str) -> IResult<&'a str, &'a str, E> {
    move |input: &'a str| {
        let (rest, matched) = tag(kw)(input)?;
        if rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
            Err(nom::Err::Error(E::from_error_kind(
                input,
                nom::error::ErrorKind::Tag,
            )))
        } else {
            Ok((rest, matched))
        }
    }
}

/// An 11-character identifier: a letter followed by ten alphanumerics.
fn uid<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, &'a str, E> {
    verify(
        take_while1(|c: char| c.is_ascii_alphanumeric()),
        |s: &str| s.len() == 11 && s.starts_with(|c: char| c.is_ascii_alphabetic()),
    )(input)
}

fn span_of(source: &str, before: &str, after: &str) -> Span {
    Span::new(source.len() - before.len(), source.len() - after.len())
}

fn variable<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (rest, name) = delimited(
        tag("V{"),
        take_while1(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
        char('}'),
    )(input)?;
    Ok((
        rest,
        Expr::Variable {
            name: name.to_string(),
            span: span_of(source, input, rest),
        },
    ))
}

fn data_element<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (rest, (stage, element)) = delimited(
        tag("#{"),
        tuple((uid, preceded(char('.'), uid))),
        char('}'),
    )(input)?;
    Ok((
        rest,
        Expr::DataElement {
            stage: stage.to_string(),
            element: element.to_string(),
            span: span_of(source, input, rest),
        },
    ))
}

fn event_date<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (rest, stage) = preceded(tag("PS_EVENTDATE:"), uid)(input)?;
    Ok((
        rest,
        Expr::EventDate {
            stage: stage.to_string(),
            span: span_of(source, input, rest),
        },
    ))
}

fn attribute<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (rest, id) = delimited(tag("A{"), uid, char('}'))(input)?;
    Ok((
        rest,
        Expr::Attribute {
            id: id.to_string(),
            span: span_of(source, input, rest),
        },
    ))
}

fn constant<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (rest, id) = delimited(tag("C{"), uid, char('}'))(input)?;
    Ok((
        rest,
        Expr::Constant {
            id: id.to_string(),
            span: span_of(source, input, rest),
        },
    ))
}

fn function_call<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    source: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (rest, name) = preceded(
        tag("d2:"),
        recognize(pair(
            take_while1(|c: char| c.is_ascii_alphabetic()),
            take_while(|c: char| c.is_ascii_alphanumeric()),
        )),
    )(input)?;
    let (rest, args) = delimited(
        preceded(multispace0, char('(')),
        separated_list0(
            preceded(multispace0, char(',')),
            delimited(multispace0, |i| expression(i, source), multispace0),
        ),
        char(')'),
    )(rest)?;
    Ok((
        rest,
        Expr::Function {
            name: name.to_string(),
            args,
            span: span_of(source, input, rest),
        },
    ))
}

fn boolean_literal<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, bool, E> {
    alt((value(true, word("true")), value(false, word("false"))))(input)
}

/// String literal in single or double quotes. The expression language has no
/// escape sequences; the first matching quote ends the literal.
fn string_literal<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, Expr, E> {
    let single = delimited(char('\''), take_till(|c| c == '\''), char('\''));
    let double = delimited(char('"'), take_till(|c| c == '"'), char('"'));
    map(alt((single, double)), |s: &str| {
        Expr::Literal(Literal::String(s.to_string()))
    })(input)
}

fn number_literal<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, Expr, E> {
    let (rest, text) = recognize(pair(digit1, opt(pair(char('.'), digit1))))(input)?;
    match Decimal::from_str(text) {
        Ok(n) => Ok((rest, Expr::Literal(Literal::Number(n)))),
        Err(_) => Err(nom::Err::Error(E::from_error_kind(
            input,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Expr, Literal};

    fn parse(input: &str) -> Expr {
        parse_expression(input).unwrap()
    }

    #[test]
    fn test_number_literal() {
        assert_eq!(
            parse("70"),
            Expr::Literal(Literal::Number(Decimal::from(70)))
        );
    }

    #[test]
    fn test_decimal_keeps_scale() {
        match parse("7.0") {
            Expr::Literal(Literal::Number(n)) => assert_eq!(n.to_string(), "7.0"),
            other => panic!("expected number, got {:?}", other),
        }
    }

    #[test]
    fn test_data_element_reference() {
        match parse("#{ProgrmStagA.DataElmentA}") {
            Expr::DataElement { stage, element, .. } => {
                assert_eq!(stage, "ProgrmStagA");
                assert_eq!(element, "DataElmentA");
            }
            other => panic!("expected data element, got {:?}", other),
        }
    }

    #[test]
    fn test_attribute_and_constant() {
        assert!(matches!(parse("A{Attribute0A}"), Expr::Attribute { .. }));
        assert!(matches!(parse("C{Constant00A}"), Expr::Constant { .. }));
    }

    #[test]
    fn test_event_date_shorthand() {
        match parse("PS_EVENTDATE:ProgrmStagA") {
            Expr::EventDate { stage, .. } => assert_eq!(stage, "ProgrmStagA"),
            other => panic!("expected event date, got {:?}", other),
        }
    }

    #[test]
    fn test_program_variable() {
        match parse("V{enrollment_date}") {
            Expr::Variable { name, .. } => assert_eq!(name, "enrollment_date"),
            other => panic!("expected variable, got {:?}", other),
        }
    }

    #[test]
    fn test_function_call_with_args() {
        match parse("d2:daysBetween(#{ProgrmStagA.DataElmentD}, PS_EVENTDATE:ProgrmStagA)") {
            Expr::Function { name, args, .. } => {
                assert_eq!(name, "daysBetween");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_function_call_no_args() {
        match parse("d2:relationshipCount()") {
            Expr::Function { name, args, .. } => {
                assert_eq!(name, "relationshipCount");
                assert!(args.is_empty());
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_multiplication_binds_tighter() {
        match parse("1 + 2 * 3") {
            Expr::Binary { op, right, .. } => {
                assert_eq!(op, BinaryOp::Add);
                assert!(matches!(
                    *right,
                    Expr::Binary {
                        op: BinaryOp::Multiply,
                        ..
                    }
                ));
            }
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_comparison_binds_looser_than_additive() {
        match parse("#{ProgrmStagA.DataElmentA} + A{Attribute0A} > 10") {
            Expr::Binary { op, .. } => assert_eq!(op, BinaryOp::Greater),
            other => panic!("expected comparison, got {:?}", other),
        }
    }

    #[test]
    fn test_double_equals_becomes_equal() {
        match parse("A{Attribute0A} == 100") {
            Expr::Binary { op, .. } => assert_eq!(op, BinaryOp::Equal),
            other => panic!("expected comparison, got {:?}", other),
        }
    }

    #[test]
    fn test_logical_operators_both_spellings() {
        assert!(matches!(
            parse("true and false"),
            Expr::Binary {
                op: BinaryOp::And,
                ..
            }
        ));
        assert!(matches!(
            parse("true && false"),
            Expr::Binary {
                op: BinaryOp::And,
                ..
            }
        ));
        assert!(matches!(
            parse("true || false"),
            Expr::Binary {
                op: BinaryOp::Or,
                ..
            }
        ));
    }

    #[test]
    fn test_parentheses_produce_group() {
        match parse("( V{enrollment_date} - V{incident_date} ) / C{Constant00A}") {
            Expr::Binary { op, left, .. } => {
                assert_eq!(op, BinaryOp::Divide);
                assert!(matches!(*left, Expr::Group(_)));
            }
            other => panic!("expected division, got {:?}", other),
        }
    }

    #[test]
    fn test_string_literal_single_and_double_quotes() {
        assert_eq!(parse("'Ongoing'").as_string(), Some("Ongoing"));
        assert_eq!(parse("\"Ongoing\"").as_string(), Some("Ongoing"));
    }

    #[test]
    fn test_string_argument_keeps_inner_expression_text() {
        match parse("d2:condition('#{ProgrmStagA.DataElmentA} > 3',10,5)") {
            Expr::Function { args, .. } => {
                assert_eq!(args[0].as_string(), Some("#{ProgrmStagA.DataElmentA} > 3"));
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_minus_and_not() {
        assert!(matches!(parse("-5"), Expr::Unary { .. }));
        assert!(matches!(parse("!true"), Expr::Unary { .. }));
        assert!(matches!(parse("not true"), Expr::Unary { .. }));
    }

    #[test]
    fn test_same_text_same_tree() {
        let a = parse("d2:zing(#{ProgrmStagA.DataElmentA} + 5)");
        let b = parse("d2:zing(#{ProgrmStagA.DataElmentA} + 5)");
        assert_eq!(a, b);
    }

    #[test]
    fn test_whitespace_insensitive_between_tokens() {
        assert_eq!(
            parse("1+2"),
            parse("1 + 2"),
        );
    }

    // =========================================================================
    // ERROR CASES
    // =========================================================================

    #[test]
    fn test_error_bare_identifier() {
        // "A" alone is not a reference, so the second "+" never attaches
        let err = parse_expression("0 + A + 4").unwrap_err();
        assert!(err.position > 0);
        assert!(!err.snippet.is_empty());
    }

    #[test]
    fn test_error_short_uid_rejected() {
        assert!(parse_expression("A{invaliduid}").is_err());
        assert!(parse_expression("#{short.DataElmentA}").is_err());
    }

    #[test]
    fn test_error_uid_must_start_with_letter() {
        assert!(parse_expression("A{0Attribute0}").is_err());
    }

    #[test]
    fn test_error_unclosed_brace() {
        assert!(parse_expression("V{enrollment_date").is_err());
    }

    #[test]
    fn test_error_unclosed_paren() {
        assert!(parse_expression("d2:zing(1").is_err());
    }

    #[test]
    fn test_error_trailing_garbage_has_position() {
        let err = parse_expression("1 + 2 #").unwrap_err();
        assert_eq!(err.position, 6);
        assert_eq!(err.snippet, "#");
    }

    #[test]
    fn test_error_empty_input() {
        let err = parse_expression("").unwrap_err();
        assert_eq!(err.snippet, "end of input");
    }

    #[test]
    fn test_error_unknown_namespace() {
        assert!(parse_expression("x2:zing(1)").is_err());
    }

    #[test]
    fn test_error_dangling_operator() {
        assert!(parse_expression("A{Attribute0A} + ").is_err());
    }
}
