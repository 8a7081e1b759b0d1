//! Directory held in memory, built from the `users` section of the config.
//!
//! Every configured user is a GAL entry and a principal that can bind; the
//! user's `contacts` form their personal address book.

use crate::condition::Condition;
use crate::config::{ContactConfig, UserConfig};
use crate::directory::{Directory, DirectoryEntry, DirectoryResult, EntryRef, Principal};
use crate::ldap_protocol::AttributeValue;
use crate::mapper::{AttributeMapper, PropertyName, DEFAULT_NAMESPACE};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    id: String,
    name: String,
    /// Keyed by lowercased local name; keeps the original spelling.
    properties: BTreeMap<String, (String, AttributeValue)>,
}

impl MemoryEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let mut entry = Self {
            id: id.into(),
            name: name.clone(),
            properties: BTreeMap::new(),
        };
        entry.set("name", name);
        entry
    }

    pub fn set(&mut self, local_name: &str, value: impl Into<AttributeValue>) {
        self.properties
            .insert(local_name.to_lowercase(), (local_name.to_string(), value.into()));
    }

    fn set_opt(&mut self, local_name: &str, value: Option<&String>) {
        if let Some(value) = value {
            self.set(local_name, value.clone());
        }
    }

    /// Fills the name properties and mail shared by users and contacts.
    fn set_person(&mut self, given_name: Option<&String>, surname: Option<&String>, mail: Option<&String>) {
        self.set_opt("givenName", given_name);
        self.set_opt("surName", surname);
        let common_name = [given_name, surname]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        if !common_name.is_empty() {
            self.set("commonName", common_name);
        }
        self.set_opt("mail", mail);
    }

    fn from_user(user: &UserConfig) -> Self {
        let mut entry = Self::new(format!("user:{}", user.name), user.name.as_str());
        entry.set("imapUid", user.name.as_str());
        entry.set("uid", user.name.as_str());
        entry.set_person(user.given_name.as_ref(), user.surname.as_ref(), user.mail.as_ref());
        for (name, value) in &user.attributes {
            entry.set(name, value.as_str());
        }
        entry
    }

    fn from_contact(owner: &str, contact: &ContactConfig) -> Self {
        let id = contact.id.to_string();
        let mut entry = Self::new(format!("contact:{}:{}", owner, id), id.as_str());
        entry.set("imapUid", id.as_str());
        entry.set("uid", id.as_str());
        entry.set_person(contact.given_name.as_ref(), contact.surname.as_ref(), contact.mail.as_ref());
        for (name, value) in &contact.attributes {
            entry.set(name, value.as_str());
        }
        entry
    }
}

impl DirectoryEntry for MemoryEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn property(&self, property: &PropertyName) -> DirectoryResult<Option<AttributeValue>> {
        if property.namespace != DEFAULT_NAMESPACE {
            return Ok(None);
        }
        Ok(self
            .properties
            .get(&property.local_name.to_lowercase())
            .map(|(_, value)| value.clone()))
    }

    fn property_names(&self) -> DirectoryResult<Vec<PropertyName>> {
        Ok(self
            .properties
            .values()
            .map(|(name, _)| PropertyName::ldap(name.as_str()))
            .collect())
    }
}

/// Returns the entries matching `condition`, at most `limit` of them.
fn select<'a>(
    entries: impl Iterator<Item = &'a Arc<MemoryEntry>>,
    condition: Option<&Condition>,
    mapper: &AttributeMapper,
    limit: usize,
) -> DirectoryResult<Vec<EntryRef>> {
    let mut selected: Vec<EntryRef> = Vec::new();
    for entry in entries {
        if selected.len() >= limit {
            break;
        }
        let matched = match condition {
            Some(condition) => condition.is_match(entry.as_ref(), mapper)?,
            None => true,
        };
        if matched {
            selected.push(Arc::clone(entry) as EntryRef);
        }
    }
    Ok(selected)
}

#[derive(Debug)]
pub struct MemoryUser {
    entry: Arc<MemoryEntry>,
    password: String,
    contacts: Vec<Arc<MemoryEntry>>,
    mapper: Arc<AttributeMapper>,
}

#[async_trait]
impl Principal for MemoryUser {
    fn name(&self) -> &str {
        self.entry.name()
    }

    async fn search_contacts(&self, condition: Option<&Condition>, limit: usize) -> DirectoryResult<Vec<EntryRef>> {
        select(self.contacts.iter(), condition, &self.mapper, limit)
    }
}

pub struct MemoryDirectory {
    users: BTreeMap<String, Arc<MemoryUser>>,
    mapper: Arc<AttributeMapper>,
}

impl MemoryDirectory {
    pub fn new(users: &[UserConfig], mapper: Arc<AttributeMapper>) -> Self {
        let users: BTreeMap<String, Arc<MemoryUser>> = users
            .iter()
            .map(|user| {
                let contacts = user
                    .contacts
                    .iter()
                    .map(|contact| Arc::new(MemoryEntry::from_contact(&user.name, contact)))
                    .collect();
                let memory_user = MemoryUser {
                    entry: Arc::new(MemoryEntry::from_user(user)),
                    password: user.password.clone(),
                    contacts,
                    mapper: Arc::clone(&mapper),
                };
                (user.name.clone(), Arc::new(memory_user))
            })
            .collect();
        info!("Loaded {} users into the in-memory directory", users.len());
        Self { users, mapper }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn authenticate(&self, user_name: &str, password: &str) -> DirectoryResult<Option<Arc<dyn Principal>>> {
        match self.users.get(user_name) {
            Some(user) if user.password == password => {
                debug!("Authenticated {}", user_name);
                let principal: Arc<dyn Principal> = Arc::clone(user) as Arc<dyn Principal>;
                Ok(Some(principal))
            }
            Some(_) => {
                warn!("Wrong password for {}", user_name);
                Ok(None)
            }
            None => {
                warn!("Unknown user {}", user_name);
                Ok(None)
            }
        }
    }

    async fn gal_find(&self, condition: Option<&Condition>, limit: usize) -> DirectoryResult<Vec<EntryRef>> {
        select(self.users.values().map(|user| &user.entry), condition, &self.mapper, limit)
    }
}
