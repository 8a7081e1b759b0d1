//! Backend collaborator traits.
//!
//! The gateway never stores people itself. A [`Directory`] authenticates
//! users and answers Global Address List lookups, an authenticated
//! [`Principal`] owns a personal contact list, and both hand back
//! [`DirectoryEntry`] trait objects whose properties are resolved on demand.

use crate::condition::Condition;
use crate::ldap_protocol::AttributeValue;
use crate::mapper::PropertyName;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The caller may not read this entry or property.
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// Read-only view of a person, either a local contact or a GAL entry.
pub trait DirectoryEntry: Send + Sync + Debug {
    /// Stable identifier used to de-duplicate results.
    fn id(&self) -> &str;

    /// Login or display name, returned as `uid`.
    fn name(&self) -> &str;

    fn property(&self, property: &PropertyName) -> DirectoryResult<Option<AttributeValue>>;

    fn property_names(&self) -> DirectoryResult<Vec<PropertyName>>;
}

pub type EntryRef = Arc<dyn DirectoryEntry>;

/// An authenticated user.
#[async_trait]
pub trait Principal: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Name the backend knows this user by in its own entries.
    fn alias(&self) -> &str {
        self.name()
    }

    /// Personal contacts matching `condition` (all of them when `None`).
    async fn search_contacts(&self, condition: Option<&Condition>, limit: usize) -> DirectoryResult<Vec<EntryRef>>;
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn authenticate(&self, user_name: &str, password: &str) -> DirectoryResult<Option<Arc<dyn Principal>>>;

    /// Global Address List lookup.
    async fn gal_find(&self, condition: Option<&Condition>, limit: usize) -> DirectoryResult<Vec<EntryRef>>;

    async fn find_entry(&self, attribute: &str, value: &str) -> DirectoryResult<Option<EntryRef>> {
        let condition = Condition::equals(attribute, value);
        Ok(self.gal_find(Some(&condition), 1).await?.into_iter().next())
    }
}
