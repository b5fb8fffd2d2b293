//! Read-only metadata model for SQL generation
//!
//! Everything the compiler needs to resolve references arrives pre-fetched in
//! a [`ProgramMetadata`] value: element and attribute value types, constant
//! values, display names, categories, and category mappings. The crate never
//! performs I/O; callers assemble metadata from whatever store they use and
//! the compiler only reads it.

use chrono::{Days, Months, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::mapping::ProgramCategoryMapping;

// =============================================================================
// VALUE TYPES
// =============================================================================

/// Value type of a data element or tracked entity attribute. Drives the
/// coercion wrapper the generator puts around each reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Number,
    Integer,
    IntegerPositive,
    IntegerNegative,
    IntegerZeroOrPositive,
    Percentage,
    Text,
    LongText,
    Letter,
    PhoneNumber,
    Email,
    Username,
    Boolean,
    TrueOnly,
    Date,
    DateTime,
    Time,
    Age,
}

impl ValueType {
    pub fn is_boolean(&self) -> bool {
        matches!(self, ValueType::Boolean | ValueType::TrueOnly)
    }

    pub fn is_text(&self) -> bool {
        matches!(
            self,
            ValueType::Text
                | ValueType::LongText
                | ValueType::Letter
                | ValueType::PhoneNumber
                | ValueType::Email
                | ValueType::Username
        )
    }

    pub fn is_date(&self) -> bool {
        matches!(
            self,
            ValueType::Date | ValueType::DateTime | ValueType::Time | ValueType::Age
        )
    }
}

// =============================================================================
// PERIOD TYPES AND BOUNDARIES
// =============================================================================

/// Calendar period used to shift a boundary by whole periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl PeriodType {
    /// Shift a date by `offset` whole periods (negative shifts backwards).
    pub fn shift(&self, date: NaiveDate, offset: i32) -> NaiveDate {
        let months = |n: i32| {
            if n >= 0 {
                date + Months::new(n as u32)
            } else {
                date - Months::new((-n) as u32)
            }
        };
        let days = |n: i64| {
            if n >= 0 {
                date + Days::new(n as u64)
            } else {
                date - Days::new((-n) as u64)
            }
        };
        match self {
            PeriodType::Daily => days(offset as i64),
            PeriodType::Weekly => days(offset as i64 * 7),
            PeriodType::Monthly => months(offset),
            PeriodType::Quarterly => months(offset * 3),
            PeriodType::Yearly => months(offset * 12),
        }
    }
}

/// Which date column a boundary constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoundaryTarget {
    EventDate,
    EnrollmentDate,
    IncidentDate,
}

impl BoundaryTarget {
    pub fn column(&self) -> &'static str {
        match self {
            BoundaryTarget::EventDate => "occurreddate",
            BoundaryTarget::EnrollmentDate => "enrollmentdate",
            BoundaryTarget::IncidentDate => "incidentdate",
        }
    }
}

/// Which edge of the reporting period the boundary anchors to, and whether
/// values must fall before or after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoundaryType {
    BeforeStartOfReportingPeriod,
    BeforeEndOfReportingPeriod,
    AfterStartOfReportingPeriod,
    AfterEndOfReportingPeriod,
}

impl BoundaryType {
    /// End-anchored boundaries compare against the day after the last day of
    /// the period, so `<` covers the full final day.
    pub fn anchors_to_end(&self) -> bool {
        matches!(
            self,
            BoundaryType::BeforeEndOfReportingPeriod | BoundaryType::AfterEndOfReportingPeriod
        )
    }

    pub fn sql_operator(&self) -> &'static str {
        match self {
            BoundaryType::BeforeStartOfReportingPeriod
            | BoundaryType::BeforeEndOfReportingPeriod => "<",
            BoundaryType::AfterStartOfReportingPeriod
            | BoundaryType::AfterEndOfReportingPeriod => ">=",
        }
    }
}

/// One boundary of the analytics window for a program indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsPeriodBoundary {
    pub target: BoundaryTarget,
    pub boundary_type: BoundaryType,
    /// Shift unit; `None` means the boundary sits exactly on the period edge
    pub period_type: Option<PeriodType>,
    /// Whole periods to shift by (ignored without a period type)
    pub offset: i32,
}

impl AnalyticsPeriodBoundary {
    pub fn new(target: BoundaryTarget, boundary_type: BoundaryType) -> Self {
        Self {
            target,
            boundary_type,
            period_type: None,
            offset: 0,
        }
    }

    pub fn with_offset(mut self, period_type: PeriodType, offset: i32) -> Self {
        self.period_type = Some(period_type);
        self.offset = offset;
        self
    }

    /// Concrete date this boundary compares against for a reporting window.
    pub fn boundary_date(&self, date_from: NaiveDate, date_to: NaiveDate) -> NaiveDate {
        let anchor = if self.boundary_type.anchors_to_end() {
            date_to + Days::new(1)
        } else {
            date_from
        };
        match self.period_type {
            Some(pt) => pt.shift(anchor, self.offset),
            None => anchor,
        }
    }
}

// =============================================================================
// PROGRAM METADATA
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataElement {
    pub name: String,
    pub value_type: ValueType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value_type: ValueType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub name: String,
    pub value: Decimal,
}

/// A disaggregation category and the option uids it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub option_ids: Vec<String>,
}

/// Everything resolvable by uid within one program. Keys are the 11-character
/// uids that appear in expression text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramMetadata {
    /// Program uid, used to name the analytics event table
    pub program: String,
    pub data_elements: HashMap<String, DataElement>,
    pub attributes: HashMap<String, Attribute>,
    pub constants: HashMap<String, Constant>,
    /// Stage uid -> display name, for expression descriptions
    pub stage_names: HashMap<String, String>,
    /// Category uid -> category, for mapping validation
    pub categories: HashMap<String, Category>,
    /// Category mappings stored on the program, keyed by mapping id
    pub category_mappings: HashMap<String, ProgramCategoryMapping>,
}

impl ProgramMetadata {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn element_value_type(&self, uid: &str) -> Option<ValueType> {
        self.data_elements.get(uid).map(|de| de.value_type)
    }

    pub fn attribute_value_type(&self, uid: &str) -> Option<ValueType> {
        self.attributes.get(uid).map(|at| at.value_type)
    }

    pub fn constant_value(&self, uid: &str) -> Option<Decimal> {
        self.constants.get(uid).map(|c| c.value)
    }
}

// =============================================================================
// PROGRAM INDICATOR
// =============================================================================

/// Whether an indicator evaluates once per event or once per enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalyticsType {
    Event,
    Enrollment,
}

/// A program indicator definition: an expression, an optional filter, and the
/// analytics settings that shape the generated SQL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramIndicator {
    pub id: String,
    pub name: String,
    /// Owning program uid
    pub program: String,
    pub analytics_type: AnalyticsType,
    pub expression: String,
    pub filter: Option<String>,
    /// Empty means the default reporting-period window applies
    pub boundaries: Vec<AnalyticsPeriodBoundary>,
    /// Categories of the indicator's disaggregation combo
    pub disaggregation_categories: Vec<String>,
    /// Ids of category mappings the indicator uses for disaggregation
    pub category_mapping_ids: Vec<String>,
}

impl ProgramIndicator {
    pub fn new(
        id: impl Into<String>,
        program: impl Into<String>,
        analytics_type: AnalyticsType,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            program: program.into(),
            analytics_type,
            expression: expression.into(),
            filter: None,
            boundaries: Vec::new(),
            disaggregation_categories: Vec::new(),
            category_mapping_ids: Vec::new(),
        }
    }

    /// The standard reporting-period window: everything from the start of the
    /// period up to (and including) its last day.
    pub fn default_boundaries() -> Vec<AnalyticsPeriodBoundary> {
        vec![
            AnalyticsPeriodBoundary::new(
                BoundaryTarget::EventDate,
                BoundaryType::BeforeEndOfReportingPeriod,
            ),
            AnalyticsPeriodBoundary::new(
                BoundaryTarget::EventDate,
                BoundaryType::AfterStartOfReportingPeriod,
            ),
        ]
    }

    /// The boundaries in effect: explicit ones, or the default window.
    pub fn effective_boundaries(&self) -> Vec<AnalyticsPeriodBoundary> {
        if self.boundaries.is_empty() {
            Self::default_boundaries()
        } else {
            self.boundaries.clone()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
