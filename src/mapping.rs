//! Category mapping resolution and validation
//!
//! Program indicators disaggregate through category mappings: each mapping
//! ties one category to a set of option filters, and an indicator references
//! the mappings that cover the categories of its disaggregation combo.
//! Validation runs in a fixed order so callers always see the most
//! fundamental conflict first: unknown category, then unknown option, then
//! duplicated options, then combo coverage.
//!
//! Resolution hands back fresh owned values. The program's stored mappings
//! are never mutated or aliased, so callers can cache resolved mappings
//! without tying their lifetime to the metadata.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::metadata::{ProgramIndicator, ProgramMetadata};
use crate::sqlgen::{compile_filter, AnalyticsContext, CompileError};

// =============================================================================
// DATA MODEL
// =============================================================================

/// Filter assigned to one category option within a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramCategoryOptionMapping {
    pub option_id: String,
    /// Boolean expression in the shared expression language
    pub filter: String,
}

/// A category mapping stored on a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramCategoryMapping {
    pub id: String,
    pub category_id: String,
    pub mapping_name: String,
    pub option_mappings: Vec<ProgramCategoryOptionMapping>,
}

/// A mapping resolved against program metadata, with category details copied
/// in. Owned throughout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCategoryMapping {
    pub mapping_id: String,
    pub category_id: String,
    pub category_name: String,
    pub option_mappings: Vec<ProgramCategoryOptionMapping>,
}

// =============================================================================
// ERRORS
// =============================================================================

/// A metadata conflict found while validating or resolving mappings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("category mapping '{mapping_id}' references unknown category '{category_id}'")]
    CategoryNotFound {
        mapping_id: String,
        category_id: String,
    },

    #[error(
        "category mapping '{mapping_id}' references option '{option_id}' which is \
         not in category '{category_id}'"
    )]
    OptionNotFound {
        mapping_id: String,
        category_id: String,
        option_id: String,
    },

    #[error("category mapping '{mapping_id}' maps option '{option_id}' more than once")]
    DuplicateOptionMapping {
        mapping_id: String,
        option_id: String,
    },

    #[error("indicator '{indicator_id}' references unknown category mapping '{mapping_id}'")]
    MappingNotFound {
        indicator_id: String,
        mapping_id: String,
    },

    #[error(
        "indicator '{indicator_id}' has no category mapping covering category \
         '{category_id}'"
    )]
    MissingCategoryMapping {
        indicator_id: String,
        category_id: String,
    },
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Validate every category mapping stored on the program. Mappings are
/// visited in id order so repeated runs report the same conflict.
pub fn validate_category_mappings(meta: &ProgramMetadata) -> Result<(), ConflictError> {
    let mut ids: Vec<&String> = meta.category_mappings.keys().collect();
    ids.sort();
    for id in ids {
        validate_mapping(meta, &meta.category_mappings[id])?;
    }
    Ok(())
}

/// Validate the mappings an indicator references, then check that they cover
/// every category of its disaggregation combo.
pub fn validate_for_indicator(
    meta: &ProgramMetadata,
    indicator: &ProgramIndicator,
) -> Result<(), ConflictError> {
    tracing::debug!(indicator = %indicator.id, "validating category mappings");
    let mut covered: HashSet<&str> = HashSet::new();
    for mapping_id in &indicator.category_mapping_ids {
        let mapping = meta.category_mappings.get(mapping_id).ok_or_else(|| {
            ConflictError::MappingNotFound {
                indicator_id: indicator.id.clone(),
                mapping_id: mapping_id.clone(),
            }
        })?;
        validate_mapping(meta, mapping)?;
        covered.insert(&mapping.category_id);
    }
    for category_id in &indicator.disaggregation_categories {
        if !covered.contains(category_id.as_str()) {
            return Err(ConflictError::MissingCategoryMapping {
                indicator_id: indicator.id.clone(),
                category_id: category_id.clone(),
            });
        }
    }
    Ok(())
}

fn validate_mapping(
    meta: &ProgramMetadata,
    mapping: &ProgramCategoryMapping,
) -> Result<(), ConflictError> {
    let category = meta.categories.get(&mapping.category_id).ok_or_else(|| {
        ConflictError::CategoryNotFound {
            mapping_id: mapping.id.clone(),
            category_id: mapping.category_id.clone(),
        }
    })?;
    for option in &mapping.option_mappings {
        if !category.option_ids.contains(&option.option_id) {
            return Err(ConflictError::OptionNotFound {
                mapping_id: mapping.id.clone(),
                category_id: mapping.category_id.clone(),
                option_id: option.option_id.clone(),
            });
        }
    }
    let mut seen: HashSet<&str> = HashSet::new();
    for option in &mapping.option_mappings {
        if !seen.insert(&option.option_id) {
            return Err(ConflictError::DuplicateOptionMapping {
                mapping_id: mapping.id.clone(),
                option_id: option.option_id.clone(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Resolve mapping ids into owned values with category details copied in.
/// Each referenced mapping is validated before it is copied out.
pub fn resolve_category_mappings(
    meta: &ProgramMetadata,
    indicator: &ProgramIndicator,
) -> Result<Vec<ResolvedCategoryMapping>, ConflictError> {
    tracing::debug!(indicator = %indicator.id, "resolving category mappings");
    let mut resolved = Vec::with_capacity(indicator.category_mapping_ids.len());
    for mapping_id in &indicator.category_mapping_ids {
        let mapping = meta.category_mappings.get(mapping_id).ok_or_else(|| {
            ConflictError::MappingNotFound {
                indicator_id: indicator.id.clone(),
                mapping_id: mapping_id.clone(),
            }
        })?;
        validate_mapping(meta, mapping)?;
        let category = &meta.categories[&mapping.category_id];
        resolved.push(ResolvedCategoryMapping {
            mapping_id: mapping.id.clone(),
            category_id: mapping.category_id.clone(),
            category_name: category.name.clone(),
            option_mappings: mapping.option_mappings.clone(),
        });
    }
    Ok(resolved)
}

/// Compile an option mapping's filter to SQL. Filters compile with boolean
/// output, like indicator filters.
pub fn compile_option_filter(
    option: &ProgramCategoryOptionMapping,
    ctx: &AnalyticsContext,
) -> Result<String, CompileError> {
    compile_filter(&option.filter, ctx)
}

// =============================================================================
// Tests
// =============================================================================
