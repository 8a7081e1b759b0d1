// Decoded LDAP search filters and their translation into backend conditions.

use crate::condition::{AttributeOperator, Condition};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstringMode {
    Initial,
    Any,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Equality,
    Substrings(SubstringMode),
    Present,
    /// Ordering, approximate and extensible matches keep their wire tag.
    Unsupported(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundKind {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleFilter {
    /// Always lowercase.
    pub attribute: String,
    pub operator: FilterOperator,
    pub value: String,
}

impl SimpleFilter {
    pub fn new(attribute: impl Into<String>, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into().to_lowercase(),
            operator,
            value: value.into(),
        }
    }

    /// `(objectclass=*)` matches any entry and carries no predicate.
    fn is_full_search(&self) -> bool {
        self.attribute == "objectclass" && self.value == "*"
    }

    fn contact_condition(&self, login: Option<&LoginAlias>) -> Option<Condition> {
        if self.is_full_search() || self.attribute.is_empty() {
            return None;
        }
        let attribute = self.attribute.as_str();
        match self.operator {
            FilterOperator::Equality => {
                let value = match login {
                    Some(login) if attribute == "uid" && self.value == login.login_name => {
                        debug!("Rewriting uid={} to principal alias {}", self.value, login.alias);
                        login.alias.clone()
                    }
                    _ => self.value.clone(),
                };
                Some(Condition::equals(attribute, value))
            }
            FilterOperator::Present => Some(Condition::not(Condition::is_null(attribute))),
            _ if self.value == "*" => Some(Condition::not(Condition::is_null(attribute))),
            // substring search on the integer imapUid is not supported
            FilterOperator::Substrings(_) if attribute == "imapuid" => None,
            FilterOperator::Substrings(SubstringMode::Initial) => {
                Some(Condition::starts_with(attribute, self.value.clone()))
            }
            FilterOperator::Substrings(_) => Some(Condition::contains(attribute, self.value.clone())),
            FilterOperator::Unsupported(_) => Some(Condition::attribute(
                attribute,
                AttributeOperator::Unsupported,
                self.value.clone(),
            )),
        }
    }
}

/// The login name a client bound with and the alias the backend knows the
/// principal by. Clients searching for themselves by login name are served
/// the principal's own entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAlias {
    pub login_name: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LdapFilter {
    Simple(SimpleFilter),
    Compound {
        kind: CompoundKind,
        children: Vec<LdapFilter>,
    },
}

impl LdapFilter {
    pub fn present(attribute: impl Into<String>) -> Self {
        LdapFilter::Simple(SimpleFilter::new(attribute, FilterOperator::Present, "*"))
    }

    /// True when the filter only selects on `objectclass=*`: the client wants
    /// to browse the whole address book.
    pub fn is_full_search(&self) -> bool {
        match self {
            LdapFilter::Simple(simple) => simple.is_full_search(),
            LdapFilter::Compound { children, .. } => children.iter().all(LdapFilter::is_full_search),
        }
    }

    /// Translates the filter into a backend condition. Terms that carry no
    /// predicate are dropped; `None` means nothing usable was left.
    pub fn contact_condition(&self, login: Option<&LoginAlias>) -> Option<Condition> {
        match self {
            LdapFilter::Simple(simple) => simple.contact_condition(login),
            LdapFilter::Compound { kind, children } => {
                let conditions: Vec<Condition> = children
                    .iter()
                    .filter_map(|child| child.contact_condition(login))
                    .collect();
                match kind {
                    CompoundKind::And => Some(Condition::and(conditions)),
                    CompoundKind::Or => Some(Condition::or(conditions)),
                    CompoundKind::Not => {
                        if conditions.is_empty() {
                            None
                        } else {
                            Some(Condition::not(Condition::and(conditions)))
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Display for LdapFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LdapFilter::Simple(simple) => {
                write!(f, "({}=", simple.attribute)?;
                match simple.operator {
                    _ if simple.value == "*" => write!(f, "*")?,
                    FilterOperator::Substrings(SubstringMode::Initial) => write!(f, "{}*", simple.value)?,
                    FilterOperator::Substrings(SubstringMode::Any) => write!(f, "*{}*", simple.value)?,
                    FilterOperator::Substrings(SubstringMode::Final) => write!(f, "*{}", simple.value)?,
                    _ => write!(f, "{}", simple.value)?,
                }
                write!(f, ")")
            }
            LdapFilter::Compound { kind, children } => {
                let prefix = match kind {
                    CompoundKind::And => "(&",
                    CompoundKind::Or => "(|",
                    CompoundKind::Not => "(!",
                };
                write!(f, "{}", prefix)?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
        }
    }
}
