//! Predicate tree evaluated against directory entries.
//!
//! Conditions are built from decoded search filters and handed to the
//! backend, which evaluates them against its candidates through the
//! [`AttributeMapper`]. All comparisons are case-insensitive.

use crate::directory::{DirectoryEntry, DirectoryResult};
use crate::mapper::AttributeMapper;
use std::fmt;
use tracing::trace;

/// Attributes that fall back to a `cn` substring match when the entry has no
/// value for them. Many address books only carry a display name.
const NAME_FALLBACK_ATTRIBUTES: &[&str] = &["givenname", "sn"];
const FALLBACK_ATTRIBUTE: &str = "cn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeOperator {
    Equals,
    Contains,
    StartsWith,
    Unsupported,
}

impl AttributeOperator {
    fn apply(self, actual: &str, expected: &str) -> bool {
        match self {
            AttributeOperator::Equals => actual == expected,
            AttributeOperator::Contains => actual.contains(expected),
            AttributeOperator::StartsWith => actual.starts_with(expected),
            AttributeOperator::Unsupported => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonoOperator {
    IsNull,
    IsTrue,
    IsFalse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Attribute {
        attribute: String,
        operator: AttributeOperator,
        value: String,
    },
    Mono {
        attribute: String,
        operator: MonoOperator,
    },
    Multi {
        operator: MultiOperator,
        conditions: Vec<Condition>,
    },
    Not(Box<Condition>),
}

impl Condition {
    pub fn attribute(attribute: impl Into<String>, operator: AttributeOperator, value: impl Into<String>) -> Self {
        Condition::Attribute {
            attribute: attribute.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn equals(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::attribute(attribute, AttributeOperator::Equals, value)
    }

    pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::attribute(attribute, AttributeOperator::Contains, value)
    }

    pub fn starts_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self::attribute(attribute, AttributeOperator::StartsWith, value)
    }

    fn mono(attribute: impl Into<String>, operator: MonoOperator) -> Self {
        Condition::Mono {
            attribute: attribute.into(),
            operator,
        }
    }

    pub fn is_null(attribute: impl Into<String>) -> Self {
        Self::mono(attribute, MonoOperator::IsNull)
    }

    pub fn is_true(attribute: impl Into<String>) -> Self {
        Self::mono(attribute, MonoOperator::IsTrue)
    }

    pub fn is_false(attribute: impl Into<String>) -> Self {
        Self::mono(attribute, MonoOperator::IsFalse)
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Multi {
            operator: MultiOperator::And,
            conditions,
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Multi {
            operator: MultiOperator::Or,
            conditions,
        }
    }

    pub fn not(condition: Condition) -> Self {
        Condition::Not(Box::new(condition))
    }

    /// A multi condition without any non-empty child carries no predicate
    /// and matches every entry.
    pub fn is_empty(&self) -> bool {
        match self {
            Condition::Multi { conditions, .. } => conditions.iter().all(Condition::is_empty),
            _ => false,
        }
    }

    pub fn is_match(&self, entry: &dyn DirectoryEntry, mapper: &AttributeMapper) -> DirectoryResult<bool> {
        if self.is_empty() {
            return Ok(true);
        }
        match self {
            Condition::Attribute {
                attribute,
                operator,
                value,
            } => match_attribute(attribute, *operator, value, entry, mapper),
            Condition::Mono { attribute, operator } => {
                let resolved = mapper.resolve(attribute, entry)?;
                let values = resolved.as_ref().map(|v| v.values()).unwrap_or_default();
                Ok(match operator {
                    MonoOperator::IsNull => values.iter().all(|v| v.is_empty()),
                    MonoOperator::IsTrue => values.iter().any(|v| v.eq_ignore_ascii_case("true")),
                    MonoOperator::IsFalse => values.iter().any(|v| v.eq_ignore_ascii_case("false")),
                })
            }
            Condition::Multi { operator, conditions } => {
                for condition in conditions {
                    let matched = condition.is_match(entry, mapper)?;
                    match operator {
                        MultiOperator::And if !matched => return Ok(false),
                        MultiOperator::Or if matched => return Ok(true),
                        _ => {}
                    }
                }
                Ok(*operator == MultiOperator::And)
            }
            Condition::Not(condition) => Ok(!condition.is_match(entry, mapper)?),
        }
    }
}

fn match_attribute(
    attribute: &str,
    operator: AttributeOperator,
    value: &str,
    entry: &dyn DirectoryEntry,
    mapper: &AttributeMapper,
) -> DirectoryResult<bool> {
    let mut operator = operator;
    let mut resolved = mapper.resolve(attribute, entry)?;
    if resolved.is_none()
        && operator != AttributeOperator::Unsupported
        && NAME_FALLBACK_ATTRIBUTES
            .iter()
            .any(|name| name.eq_ignore_ascii_case(attribute))
    {
        trace!("{} absent on {}, matching against {}", attribute, entry.id(), FALLBACK_ATTRIBUTE);
        resolved = mapper.resolve(FALLBACK_ATTRIBUTE, entry)?;
        operator = AttributeOperator::Contains;
    }

    let Some(resolved) = resolved else {
        return Ok(false);
    };
    let expected = value.to_lowercase();
    Ok(resolved
        .values()
        .iter()
        .any(|actual| operator.apply(&actual.to_lowercase(), &expected)))
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Attribute {
                attribute,
                operator,
                value,
            } => {
                let op = match operator {
                    AttributeOperator::Equals => "=",
                    AttributeOperator::Contains => "contains",
                    AttributeOperator::StartsWith => "starts-with",
                    AttributeOperator::Unsupported => "?",
                };
                write!(f, "{} {} '{}'", attribute, op, value)
            }
            Condition::Mono { attribute, operator } => {
                let op = match operator {
                    MonoOperator::IsNull => "is null",
                    MonoOperator::IsTrue => "is true",
                    MonoOperator::IsFalse => "is false",
                };
                write!(f, "{} {}", attribute, op)
            }
            Condition::Multi { operator, conditions } => {
                let joiner = match operator {
                    MultiOperator::And => " and ",
                    MultiOperator::Or => " or ",
                };
                write!(f, "(")?;
                for (i, condition) in conditions.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", joiner)?;
                    }
                    write!(f, "{}", condition)?;
                }
                write!(f, ")")
            }
            Condition::Not(condition) => write!(f, "not {}", condition),
        }
    }
}
