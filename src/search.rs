//! Execution of a single LDAP search.
//!
//! A search is dispatched on its base DN: discovery fixtures (root DSE, base
//! context, Apple computer record) are answered directly, user contexts are
//! served from the requester's personal contacts merged with the Global
//! Address List. Every search that is not abandoned ends with exactly one
//! SearchResultDone.

use crate::condition::Condition;
use crate::directory::{Directory, DirectoryEntry, DirectoryError, DirectoryResult, EntryRef, Principal};
use crate::filter::{LdapFilter, LoginAlias};
use crate::ldap_protocol::{
    AttributeValue, EntryAttributes, SearchRequest, SearchScope, LDAP_SIZE_LIMIT_EXCEEDED, LDAP_SUCCESS,
    LDAP_TAG_SEARCH_RESULT_DONE, LDAP_TIME_LIMIT_EXCEEDED,
};
use crate::mapper::AttributeMapper;
use crate::metrics::Metrics;
use crate::response::{ResponseHandler, BASE_CONTEXT, COMPUTER_CONTEXT};
use crate::search_manager::SearchRegistration;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const MSLIVE_BASE_CONTEXT: &str = "c=US";
pub const OD_USER_CONTEXT: &str = "cn=users, o=od";
pub const OD_CONFIG_CONTEXT: &str = "cn=config, o=od";
pub const OD_GROUP_CONTEXT: &str = "cn=groups, o=od";
pub const COMPUTER_CONTEXT_LION: &str = "cn=computers,o=od";
pub const OD_USER_CONTEXT_LION: &str = "cn=users, ou=people";

pub const PERSON_OBJECT_CLASSES: &[&str] = &["top", "person", "organizationalPerson", "inetOrgPerson", "apple-user"];

/// Attributes every person entry carries regardless of the backend.
const STATIC_ATTRIBUTES: &[(&str, &str)] = &[(
    "apple-serviceslocator",
    "52486C30-F0AB-48E3-9C37-37E9B28CDD7B:D6DD8A10-1098-11DE-8C30-0800200C9A66:calendar",
)];

/// Attribute a person's entry is looked up by in `uid=<x>,...` base searches.
const CONTACT_ID_ATTRIBUTE: &str = "imapUid";

/// Services shared by every search.
pub struct SearchContext {
    pub directory: Arc<dyn Directory>,
    pub mapper: Arc<AttributeMapper>,
    pub metrics: Arc<Metrics>,
}

/// How a search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Completed { sent: usize, result_code: i32 },
    /// Stopped by ABANDON; no terminal response was sent.
    Abandoned { sent: usize },
    /// A backend error was reported to the client.
    Failed,
    /// The client went away mid-search.
    Disconnected,
}

#[derive(Debug, Error)]
enum SearchError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Normalises the client's size limit: 0 or anything above `max` means `max`.
pub fn normalize_size_limit(requested: i32, max: usize) -> usize {
    match usize::try_from(requested) {
        Ok(limit) if limit > 0 && limit <= max => limit,
        _ => max,
    }
}

fn is_user_context(dn: &str) -> bool {
    dn.is_empty()
        || dn.eq_ignore_ascii_case(BASE_CONTEXT)
        || dn.eq_ignore_ascii_case(OD_USER_CONTEXT)
        || dn.eq_ignore_ascii_case(MSLIVE_BASE_CONTEXT)
        || dn.eq_ignore_ascii_case(OD_USER_CONTEXT_LION)
}

fn is_computer_context(dn: &str) -> bool {
    dn.eq_ignore_ascii_case(COMPUTER_CONTEXT) || dn.eq_ignore_ascii_case(COMPUTER_CONTEXT_LION)
}

/// Splits `uid=<x>,<rest>` into `<x>` and `,<rest>`.
fn split_user_dn(dn: &str) -> Option<(&str, &str)> {
    let comma = dn.find(',')?;
    let uid = dn[..comma].strip_prefix("uid=")?;
    Some((uid, &dn[comma..]))
}

/// Builds the attributes sent for one person.
///
/// `requester` is the name of the bound principal; when the person is the
/// requester itself, `uidnumber` is filled in for clients that ask for it.
pub fn person_attributes(
    mapper: &AttributeMapper,
    person: &dyn DirectoryEntry,
    returning: &BTreeSet<String>,
    requester: Option<&str>,
) -> DirectoryResult<EntryAttributes> {
    let return_all = returning.is_empty();
    let mut attributes = EntryAttributes::new();
    attributes.insert("uid".to_string(), AttributeValue::from(person.name()));

    for mapped in mapper.build_attribute_set(return_all, returning, person)? {
        if let Some(value) = mapper.property(&mapped.property, person)? {
            attributes.insert(mapped.ldap_name, value);
        }
    }

    for (name, value) in STATIC_ATTRIBUTES {
        if return_all || returning.contains(*name) {
            attributes.insert(name.to_string(), AttributeValue::from(*value));
        }
    }

    if return_all || returning.contains("objectclass") {
        attributes.insert(
            "objectClass".to_string(),
            AttributeValue::Multiple(PERSON_OBJECT_CLASSES.iter().map(|c| c.to_string()).collect()),
        );
    }

    let uid = attributes
        .get("uid")
        .and_then(AttributeValue::first)
        .unwrap_or(person.name())
        .to_string();

    // iCal looks people up by generated uid
    if return_all || returning.contains("apple-generateduid") {
        let generated = match attributes.get("mail").and_then(AttributeValue::first) {
            Some(mail) => mail.replace('@', "__AT__"),
            None => uid.clone(),
        };
        attributes.insert("apple-generateduid".to_string(), AttributeValue::from(generated));
    }

    if let Some(requester) = requester {
        if requester == uid && returning.contains("uidnumber") {
            attributes.insert("uidnumber".to_string(), AttributeValue::from(requester));
        }
    }

    Ok(attributes)
}

/// Entries gathered for a search: insertion-ordered, de-duplicated by id and
/// capped at the size limit.
struct ResultSet {
    limit: usize,
    entries: Vec<EntryRef>,
    seen: HashSet<String>,
}

impl ResultSet {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.entries.len())
    }

    fn extend(&mut self, entries: Vec<EntryRef>) {
        for entry in entries {
            if self.is_full() {
                break;
            }
            if self.seen.insert(entry.id().to_string()) {
                self.entries.push(entry);
            }
        }
    }

    fn into_vec(self) -> Vec<EntryRef> {
        self.entries
    }
}

/// A decoded search request bound to the connection state it runs with.
#[derive(Debug)]
pub struct SearchOperation {
    pub message_id: i32,
    pub base_dn: String,
    pub scope: SearchScope,
    pub size_limit: usize,
    pub time_limit: Option<Duration>,
    pub filter: LdapFilter,
    /// Lowercased; empty means all attributes.
    pub returning: BTreeSet<String>,
    pub user: Option<Arc<dyn Principal>>,
    /// Name the client bound with.
    pub login_name: Option<String>,
}

impl SearchOperation {
    pub fn new(
        message_id: i32,
        request: SearchRequest,
        max_size_limit: usize,
        user: Option<Arc<dyn Principal>>,
        login_name: Option<String>,
    ) -> Self {
        let time_limit = u64::try_from(request.time_limit)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        Self {
            message_id,
            base_dn: request.base_object,
            scope: request.scope,
            size_limit: normalize_size_limit(request.size_limit, max_size_limit),
            time_limit,
            filter: request.filter,
            returning: request.attributes.into_iter().collect(),
            user,
            login_name,
        }
    }

    /// Searches over user contexts hit the backend and run on their own task;
    /// everything else is answered inline.
    pub fn runs_in_background(&self) -> bool {
        let dn = self.base_dn.as_str();
        dn.eq_ignore_ascii_case(BASE_CONTEXT)
            || dn.eq_ignore_ascii_case(OD_USER_CONTEXT)
            || dn.eq_ignore_ascii_case(OD_USER_CONTEXT_LION)
    }

    /// Runs the search to completion. `registration` is released on return,
    /// whatever the outcome.
    pub async fn run(
        self,
        context: Arc<SearchContext>,
        responses: Arc<ResponseHandler>,
        registration: SearchRegistration,
    ) -> SearchOutcome {
        let started = Instant::now();
        let message_id = self.message_id;
        let deadline = self.time_limit.map(|limit| started + limit);
        let mut run = SearchRun {
            operation: self,
            context: Arc::clone(&context),
            responses: Arc::clone(&responses),
            registration,
            deadline,
            time_exceeded: false,
        };

        let outcome = match run.execute().await {
            Ok(outcome) => outcome,
            Err(SearchError::Io(e)) => {
                warn!("Search {} stopped, client connection failed: {}", message_id, e);
                SearchOutcome::Disconnected
            }
            Err(SearchError::Directory(e)) => {
                error!("Search {} failed: {}", message_id, e);
                context.metrics.inc_error("search");
                if let Err(send_error) = responses
                    .send_err(message_id, LDAP_TAG_SEARCH_RESULT_DONE, &e)
                    .await
                {
                    debug!("Could not report search failure to client: {}", send_error);
                }
                SearchOutcome::Failed
            }
        };
        drop(run);

        let elapsed = started.elapsed();
        context.metrics.observe_search(elapsed);
        match outcome {
            SearchOutcome::Completed { sent, .. } => context.metrics.add_entries_sent(sent),
            SearchOutcome::Abandoned { sent } => {
                context.metrics.add_entries_sent(sent);
                context.metrics.inc_abandoned();
            }
            _ => {}
        }
        debug!("Search {} finished in {:?}: {:?}", message_id, elapsed, outcome);
        outcome
    }
}

struct SearchRun {
    operation: SearchOperation,
    context: Arc<SearchContext>,
    responses: Arc<ResponseHandler>,
    registration: SearchRegistration,
    deadline: Option<Instant>,
    time_exceeded: bool,
}

impl SearchRun {
    /// True when gathering must stop: the search was abandoned or ran out of
    /// time.
    fn should_stop(&mut self) -> bool {
        if self.registration.is_abandoned() {
            return true;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                if !self.time_exceeded {
                    info!("Search {} exceeded its time limit", self.operation.message_id);
                }
                self.time_exceeded = true;
            }
        }
        self.time_exceeded
    }

    async fn execute(&mut self) -> Result<SearchOutcome, SearchError> {
        let op = &self.operation;
        let message_id = op.message_id;
        debug!(
            "LDAP search {} (registration {}): base='{}' scope={:?} size_limit={} time_limit={:?} filter={} attributes={:?}",
            message_id,
            self.registration.id(),
            op.base_dn,
            op.scope,
            op.size_limit,
            op.time_limit,
            op.filter,
            op.returning
        );
        let dn = op.base_dn.clone();
        let mut sent = 0;

        if op.scope == SearchScope::BaseObject {
            if dn.is_empty() {
                info!("Sending root DSE");
                self.responses.send_root_dse(message_id).await?;
                sent = 1;
            } else if dn.eq_ignore_ascii_case(BASE_CONTEXT) {
                info!("Sending base context");
                self.responses.send_base_context(message_id).await?;
                sent = 1;
            } else if let Some((uid, rest)) = split_user_dn(&dn) {
                match op.user.clone() {
                    Some(user) => {
                        let persons = self.find_person(user.as_ref(), uid).await?;
                        sent = self.send_persons(&persons, rest).await?;
                    }
                    None => debug!("Anonymous access to {} forbidden", dn),
                }
            } else {
                debug!("Invalid base object DN '{}' for search {}", dn, message_id);
            }
        } else if is_computer_context(&dn) {
            info!("Sending computer context");
            self.responses
                .send_computer_context(message_id, &op.returning)
                .await?;
            sent = 1;
        } else if is_user_context(&dn) {
            match op.user.clone() {
                Some(user) => {
                    let persons = self.collect_persons(user.as_ref()).await?;
                    let base_context = format!(", {}", dn);
                    sent = self.send_persons(&persons, &base_context).await?;
                }
                None => debug!("Anonymous access to {} forbidden", dn),
            }
        } else if !dn.eq_ignore_ascii_case(OD_CONFIG_CONTEXT) && !dn.eq_ignore_ascii_case(OD_GROUP_CONTEXT) {
            debug!("Invalid DN '{}' for search {}", dn, message_id);
        }

        if self.registration.is_abandoned() {
            info!("Search {} abandoned after {} entries", message_id, sent);
            return Ok(SearchOutcome::Abandoned { sent });
        }

        let size_limit = self.operation.size_limit;
        let result_code = if sent > 1 && sent == size_limit {
            debug!("Search {} hit size limit {}", message_id, size_limit);
            LDAP_SIZE_LIMIT_EXCEEDED
        } else if self.time_exceeded {
            LDAP_TIME_LIMIT_EXCEEDED
        } else {
            LDAP_SUCCESS
        };
        self.responses
            .send_client(message_id, LDAP_TAG_SEARCH_RESULT_DONE, result_code, "")
            .await?;
        Ok(SearchOutcome::Completed { sent, result_code })
    }

    /// Looks up the single person named by a `uid=<x>,...` base DN: among
    /// the requester's contacts when `<x>` is a contact id, then in the GAL.
    async fn find_person(&mut self, user: &dyn Principal, uid: &str) -> Result<Vec<EntryRef>, SearchError> {
        let mut persons = Vec::new();
        if uid.parse::<u64>().is_ok() {
            let condition = Condition::equals(CONTACT_ID_ATTRIBUTE, uid);
            persons = self
                .local_contacts(user, Some(&condition), self.operation.size_limit)
                .await?;
        }
        if persons.is_empty() && !self.should_stop() {
            info!("GAL lookup of {}", uid);
            let found = tolerate_access_errors(
                "GAL",
                self.context
                    .directory
                    .find_entry(CONTACT_ID_ATTRIBUTE, uid)
                    .await,
            )?;
            persons.extend(found);
        }
        Ok(persons)
    }

    /// Personal contacts followed by GAL entries, up to the size limit.
    async fn collect_persons(&mut self, user: &dyn Principal) -> Result<Vec<EntryRef>, SearchError> {
        let size_limit = self.operation.size_limit;
        let mut persons = ResultSet::new(size_limit);

        if self.operation.filter.is_full_search() {
            debug!("Full search: personal contacts, then GAL by initial letter");
            persons.extend(self.local_contacts(user, None, size_limit).await?);
            for letter in 'A'..='Z' {
                if persons.is_full() || self.should_stop() {
                    break;
                }
                let starts_with = Condition::starts_with("cn", letter.to_string());
                persons.extend(self.gal_find(&starts_with, size_limit).await?);
            }
            return Ok(persons.into_vec());
        }

        let login = match (&self.operation.login_name, self.operation.user.as_ref()) {
            (Some(login_name), Some(principal)) => Some(LoginAlias {
                login_name: login_name.clone(),
                alias: principal.alias().to_string(),
            }),
            _ => None,
        };
        let Some(condition) = self.operation.filter.contact_condition(login.as_ref()) else {
            // every term of the filter was ignorable
            debug!("Filter {} carries no usable predicate", self.operation.filter);
            return Ok(Vec::new());
        };
        debug!("Contact condition: {}", condition);

        persons.extend(self.local_contacts(user, Some(&condition), size_limit).await?);
        if !persons.is_full() && !self.should_stop() {
            let remaining = persons.remaining();
            persons.extend(self.gal_find(&condition, remaining).await?);
        }
        Ok(persons.into_vec())
    }

    async fn local_contacts(
        &mut self,
        user: &dyn Principal,
        condition: Option<&Condition>,
        limit: usize,
    ) -> Result<Vec<EntryRef>, SearchError> {
        let contacts = tolerate_access_errors("contacts", user.search_contacts(condition, limit).await)?;
        debug!("{} personal contacts matched", contacts.len());
        Ok(contacts)
    }

    async fn gal_find(&mut self, condition: &Condition, limit: usize) -> Result<Vec<EntryRef>, SearchError> {
        let found = tolerate_access_errors(
            "GAL",
            self.context.directory.gal_find(Some(condition), limit).await,
        )?;
        debug!("GAL lookup {} returned {} entries", condition, found.len());
        Ok(found)
    }

    async fn send_persons(&mut self, persons: &[EntryRef], base_context: &str) -> Result<usize, SearchError> {
        let requester = self.operation.user.as_ref().map(|u| u.name().to_string());
        let mut sent = 0;
        for person in persons {
            if self.registration.is_abandoned() {
                warn!("Search {} abandoned, stopping after {} entries", self.operation.message_id, sent);
                break;
            }
            let attributes = person_attributes(
                &self.context.mapper,
                person.as_ref(),
                &self.operation.returning,
                requester.as_deref(),
            )?;
            let uid = attributes
                .get("uid")
                .and_then(AttributeValue::first)
                .unwrap_or(person.name());
            let dn = format!("uid={}{}", uid, base_context);
            debug!("Sending person {}", dn);
            self.responses
                .send_entry(self.operation.message_id, &dn, &attributes)
                .await?;
            sent += 1;
        }
        Ok(sent)
    }
}

/// Lookups the requester may not perform are treated as empty.
fn tolerate_access_errors<T: Default>(source: &str, result: DirectoryResult<T>) -> DirectoryResult<T> {
    match result {
        Err(DirectoryError::NotAuthorized(reason)) => {
            warn!("{} lookup not authorized: {}", source, reason);
            Ok(T::default())
        }
        Err(DirectoryError::BadRequest(reason)) => {
            warn!("{} lookup rejected: {}", source, reason);
            Ok(T::default())
        }
        other => other,
    }
}
