// Shared fixtures for unit tests: in-memory entries, a scripted directory
// and a writer that captures everything sent to a client.

use crate::condition::Condition;
use crate::directory::{Directory, DirectoryEntry, DirectoryError, DirectoryResult, EntryRef, Principal};
use crate::ldap_protocol::{decode_responses, AttributeValue, DecodedResponse};
use crate::mapper::{AttributeMapper, PropertyName};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

#[derive(Debug, Clone)]
enum TestValue {
    Value(AttributeValue),
    Hidden,
    Failing,
}

#[derive(Debug, Clone)]
pub struct TestEntry {
    id: String,
    name: String,
    properties: Vec<(String, TestValue)>,
}

impl TestEntry {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn with(self, property: &str, value: &str) -> Self {
        self.set(property, TestValue::Value(AttributeValue::from(value)))
    }

    pub fn with_list(self, property: &str, values: &[&str]) -> Self {
        let values = values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        self.set(property, TestValue::Value(AttributeValue::from(values)))
    }

    /// Reading this property fails with `NotAuthorized`.
    pub fn with_hidden(self, property: &str) -> Self {
        self.set(property, TestValue::Hidden)
    }

    /// Reading this property fails with a backend error.
    pub fn with_failing(self, property: &str) -> Self {
        self.set(property, TestValue::Failing)
    }

    /// Later builders override earlier ones for the same property.
    fn set(mut self, property: &str, value: TestValue) -> Self {
        self.properties.retain(|(name, _)| !name.eq_ignore_ascii_case(property));
        self.properties.push((property.to_string(), value));
        self
    }

    pub fn into_ref(self) -> EntryRef {
        Arc::new(self)
    }
}

impl DirectoryEntry for TestEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn property(&self, property: &PropertyName) -> DirectoryResult<Option<AttributeValue>> {
        let found = self
            .properties
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&property.local_name));
        match found {
            Some((_, TestValue::Value(value))) => Ok(Some(value.clone())),
            Some((name, TestValue::Hidden)) => Err(DirectoryError::NotAuthorized(name.clone())),
            Some((name, TestValue::Failing)) => Err(DirectoryError::Other(anyhow::anyhow!("backend failure reading {}", name))),
            None if property.local_name == "name" => Ok(Some(AttributeValue::from(self.name.as_str()))),
            None => Ok(None),
        }
    }

    fn property_names(&self) -> DirectoryResult<Vec<PropertyName>> {
        let mut names = vec![PropertyName::ldap("name")];
        names.extend(
            self.properties
                .iter()
                .filter(|(_, value)| matches!(value, TestValue::Value(_)))
                .map(|(name, _)| PropertyName::ldap(name.as_str())),
        );
        Ok(names)
    }
}

fn select(entries: &[EntryRef], condition: Option<&Condition>, limit: usize) -> DirectoryResult<Vec<EntryRef>> {
    let mapper = AttributeMapper::default();
    let mut selected = Vec::new();
    for entry in entries {
        if selected.len() >= limit {
            break;
        }
        let matched = match condition {
            Some(condition) => condition.is_match(entry.as_ref(), &mapper)?,
            None => true,
        };
        if matched {
            selected.push(Arc::clone(entry));
        }
    }
    Ok(selected)
}

#[derive(Debug)]
pub struct TestPrincipal {
    pub name: String,
    pub contacts: Vec<EntryRef>,
}

impl TestPrincipal {
    pub fn new(name: &str, contacts: Vec<EntryRef>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            contacts,
        })
    }
}

#[async_trait]
impl Principal for TestPrincipal {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search_contacts(&self, condition: Option<&Condition>, limit: usize) -> DirectoryResult<Vec<EntryRef>> {
        select(&self.contacts, condition, limit)
    }
}

type GalHook = Box<dyn Fn(Option<&Condition>) -> DirectoryResult<()> + Send + Sync>;

/// Directory backed by a fixed GAL. Every `gal_find` is recorded and can be
/// intercepted by a hook.
#[derive(Default)]
pub struct TestDirectory {
    pub gal: Vec<EntryRef>,
    pub users: Vec<(String, String)>,
    gal_queries: Mutex<Vec<Option<String>>>,
    hook: Option<GalHook>,
}

impl TestDirectory {
    pub fn new(gal: Vec<EntryRef>) -> Self {
        Self {
            gal,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, name: &str, password: &str) -> Self {
        self.users.push((name.to_string(), password.to_string()));
        self
    }

    pub fn with_hook(mut self, hook: impl Fn(Option<&Condition>) -> DirectoryResult<()> + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Conditions of all GAL lookups so far, rendered as text.
    pub fn gal_queries(&self) -> Vec<Option<String>> {
        self.gal_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Directory for TestDirectory {
    async fn authenticate(&self, user_name: &str, password: &str) -> DirectoryResult<Option<Arc<dyn Principal>>> {
        let known = self
            .users
            .iter()
            .any(|(name, pw)| name == user_name && pw == password);
        if !known {
            return Ok(None);
        }
        let principal: Arc<dyn Principal> = TestPrincipal::new(user_name, Vec::new());
        Ok(Some(principal))
    }

    async fn gal_find(&self, condition: Option<&Condition>, limit: usize) -> DirectoryResult<Vec<EntryRef>> {
        self.gal_queries
            .lock()
            .unwrap()
            .push(condition.map(|c| c.to_string()));
        if let Some(hook) = &self.hook {
            hook(condition)?;
        }
        select(&self.gal, condition, limit)
    }
}

/// AsyncWrite that appends into a shared buffer.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn bytes(&self) -> Vec<u8> {
        self.buffer.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<DecodedResponse> {
        decode_responses(&self.bytes())
    }
}

impl AsyncWrite for CapturedOutput {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// AsyncWrite whose peer has gone away.
#[derive(Debug, Default)]
pub struct BrokenPipe;

impl AsyncWrite for BrokenPipe {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
