// Mapping between LDAP attribute names and backend properties.

use crate::directory::{DirectoryEntry, DirectoryError, DirectoryResult};
use crate::ldap_protocol::AttributeValue;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, trace};

/// Namespace of backend properties that have no explicit mapping.
pub const DEFAULT_NAMESPACE: &str = "ldap";

/// (LDAP name, backend property, canonical LDAP name for that property)
const ATTRIBUTE_ALIASES: &[(&str, &str, bool)] = &[
    ("uid", "name", true),
    ("sn", "surName", true),
    ("surname", "surName", false),
    ("cn", "commonName", true),
    ("nsaimid", "commonName", false),
    ("c", "country", true),
    ("co", "friendlyCountryName", true),
    ("givenname", "givenName", true),
    ("gn", "givenName", false),
    ("o", "organizationName", true),
];

/// Namespaced backend property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyName {
    pub namespace: String,
    pub local_name: String,
}

impl PropertyName {
    pub fn new(namespace: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local_name: local_name.into(),
        }
    }

    pub fn ldap(local_name: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, local_name)
    }
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.local_name)
    }
}

/// A backend property paired with the LDAP attribute name it is returned as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedProperty {
    pub ldap_name: String,
    pub property: PropertyName,
}

#[derive(Debug, Clone)]
pub struct AttributeMapper {
    namespace: String,
}

impl Default for AttributeMapper {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl AttributeMapper {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// LDAP attribute names are case-insensitive; unknown names map to the
    /// same local name in the default namespace.
    pub fn map_to_backend_prop(&self, ldap_name: &str) -> PropertyName {
        let local_name = ATTRIBUTE_ALIASES
            .iter()
            .find(|(alias, _, _)| alias.eq_ignore_ascii_case(ldap_name))
            .map(|(_, property, _)| *property)
            .unwrap_or(ldap_name);
        PropertyName::new(self.namespace.as_str(), local_name)
    }

    pub fn map_to_ldap_prop(&self, property: &PropertyName) -> String {
        ATTRIBUTE_ALIASES
            .iter()
            .find(|(_, local, canonical)| *canonical && *local == property.local_name)
            .map(|(alias, _, _)| alias.to_string())
            .unwrap_or_else(|| property.local_name.clone())
    }

    /// Value of `property` on `entry`. Properties the caller may not read
    /// are treated as absent.
    pub fn property(&self, property: &PropertyName, entry: &dyn DirectoryEntry) -> DirectoryResult<Option<AttributeValue>> {
        match entry.property(property) {
            Ok(value) => {
                if value.is_none() {
                    trace!("{} has no value for {}", entry.id(), property);
                }
                Ok(value)
            }
            Err(DirectoryError::NotAuthorized(reason)) => {
                debug!("Not authorized to read {} on {}: {}", property, entry.id(), reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn resolve(&self, ldap_name: &str, entry: &dyn DirectoryEntry) -> DirectoryResult<Option<AttributeValue>> {
        self.property(&self.map_to_backend_prop(ldap_name), entry)
    }

    /// Properties to emit for `entry`: every property it has when all
    /// attributes are requested, otherwise the requested names.
    pub fn build_attribute_set(
        &self,
        return_all: bool,
        requested: &BTreeSet<String>,
        entry: &dyn DirectoryEntry,
    ) -> DirectoryResult<Vec<MappedProperty>> {
        if !return_all {
            return Ok(requested
                .iter()
                .map(|name| MappedProperty {
                    ldap_name: name.clone(),
                    property: self.map_to_backend_prop(name),
                })
                .collect());
        }

        let names = match entry.property_names() {
            Ok(names) => names,
            Err(DirectoryError::NotAuthorized(reason)) => {
                debug!("Not authorized to list properties of {}: {}", entry.id(), reason);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(names
            .into_iter()
            .map(|property| MappedProperty {
                ldap_name: self.map_to_ldap_prop(&property),
                property,
            })
            .collect())
    }
}
