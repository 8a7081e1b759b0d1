// Response side of a client connection.
//
// Every message is encoded into its own buffer and written while holding the
// connection's write lock, so responses from concurrent searches never
// interleave on the wire.

use crate::ldap_protocol::{
    encode_bind_response, encode_ldap_result, encode_search_result_entry, AttributeValue, EntryAttributes,
    LdapVersion, LDAP_OTHER,
};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

pub const BASE_CONTEXT: &str = "ou=people";
pub const OD_BASE_CONTEXT: &str = "o=od";
pub const COMPUTER_CONTEXT: &str = "cn=computers, o=od";
pub const NAMING_CONTEXTS: &[&str] = &[BASE_CONTEXT, OD_BASE_CONTEXT];

pub const ROOT_DSE_DN: &str = "Root DSE";
pub const BASE_CONTEXT_DESCRIPTION: &str = "Milton LDAP Gateway";

pub const COMPUTER_GUID: &str = "52486C30-F0AB-48E3-9C37-37E9B28CDD7B";
pub const VIRTUALHOST_GUID: &str = "D6DD8A10-1098-11DE-8C30-0800200C9A66";

pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ResponseHandler {
    writer: Mutex<ClientWriter>,
    version: AtomicU8,
    host_name: String,
}

impl ResponseHandler {
    /// `host_name` is advertised in the computer record.
    pub fn new(writer: ClientWriter, host_name: impl Into<String>) -> Self {
        Self {
            writer: Mutex::new(writer),
            version: AtomicU8::new(LdapVersion::V3.as_u8()),
            host_name: host_name.into(),
        }
    }

    pub fn version(&self) -> LdapVersion {
        LdapVersion::from_wire(i32::from(self.version.load(Ordering::Relaxed)))
    }

    pub fn set_version(&self, version: LdapVersion) {
        self.version.store(version.as_u8(), Ordering::Relaxed);
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    async fn send(&self, message: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(message).await?;
        writer.flush().await
    }

    pub async fn send_entry(&self, message_id: i32, dn: &str, attributes: &EntryAttributes) -> io::Result<()> {
        trace!("send entry {} dn={} ({} attributes)", message_id, dn, attributes.len());
        self.send(&encode_search_result_entry(message_id, dn, attributes, self.version()))
            .await
    }

    pub async fn send_client(&self, message_id: i32, op_tag: u8, result_code: i32, message: &str) -> io::Result<()> {
        trace!("send result {} op=0x{:02X} code={}", message_id, op_tag, result_code);
        self.send(&encode_ldap_result(message_id, op_tag, result_code, message, self.version()))
            .await
    }

    pub async fn send_err(&self, message_id: i32, op_tag: u8, error: &(dyn Display + Sync)) -> io::Result<()> {
        self.send_client(message_id, op_tag, LDAP_OTHER, &error.to_string())
            .await
    }

    pub async fn send_bind_response(
        &self,
        message_id: i32,
        status: i32,
        server_credentials: Option<&[u8]>,
    ) -> io::Result<()> {
        self.send(&encode_bind_response(message_id, status, server_credentials, self.version()))
            .await
    }

    pub async fn send_root_dse(&self, message_id: i32) -> io::Result<()> {
        debug!("Sending root DSE");
        let mut attributes = EntryAttributes::new();
        attributes.insert("objectClass".to_string(), AttributeValue::from("top"));
        attributes.insert("namingContexts".to_string(), string_list(NAMING_CONTEXTS));
        self.send_entry(message_id, ROOT_DSE_DN, &attributes).await
    }

    pub async fn send_base_context(&self, message_id: i32) -> io::Result<()> {
        let mut attributes = EntryAttributes::new();
        attributes.insert("objectClass".to_string(), string_list(&["top", "organizationalUnit"]));
        attributes.insert("description".to_string(), AttributeValue::from(BASE_CONTEXT_DESCRIPTION));
        self.send_entry(message_id, BASE_CONTEXT, &attributes).await
    }

    /// Apple computer record advertising the calendar service. Only the
    /// requested attributes are sent; all of them when none were requested.
    pub async fn send_computer_context(&self, message_id: i32, returning: &BTreeSet<String>) -> io::Result<()> {
        let service_info = service_info(&self.host_name);
        let candidates = [
            ("objectClass", string_list(&["top", "apple-computer"])),
            ("apple-generateduid", AttributeValue::from(COMPUTER_GUID)),
            ("apple-serviceinfo", AttributeValue::from(service_info.as_str())),
            ("apple-xmlplist", AttributeValue::from(service_info.as_str())),
            ("apple-serviceslocator", AttributeValue::from("::anyService")),
            ("cn", AttributeValue::from(self.host_name.as_str())),
        ];
        let attributes: EntryAttributes = candidates
            .into_iter()
            .filter(|(name, _)| returning.is_empty() || returning.contains(&name.to_lowercase()))
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        let dn = format!("cn={}, {}", self.host_name, COMPUTER_CONTEXT);
        debug!("Sending computer context {} ({} attributes)", dn, attributes.len());
        self.send_entry(message_id, &dn, &attributes).await
    }
}

fn string_list(values: &[&str]) -> AttributeValue {
    AttributeValue::Multiple(values.iter().map(|v| v.to_string()).collect())
}

/// Property list describing the calendar service of `host_name`.
pub fn service_info(host_name: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='UTF-8'?>\
<!DOCTYPE plist PUBLIC '-//Apple//DTD PLIST 1.0//EN' 'http://www.apple.com/DTDs/PropertyList-1.0.dtd'>\
<plist version='1.0'>\
<dict>\
<key>com.apple.macosxserver.host</key>\
<array>\
<string>localhost</string>\
</array>\
<key>com.apple.macosxserver.virtualhosts</key>\
<dict>\
<key>{guid}</key>\
<dict>\
<key>hostDetails</key>\
<dict>\
<key>http</key>\
<dict>\
<key>enabled</key>\
<true/>\
</dict>\
<key>https</key>\
<dict>\
<key>disabled</key>\
<false/>\
<key>port</key>\
<integer>0</integer>\
</dict>\
</dict>\
<key>hostname</key>\
<string>{host}</string>\
<key>serviceInfo</key>\
<dict>\
<key>calendar</key>\
<dict>\
<key>enabled</key>\
<true/>\
<key>templates</key>\
<dict>\
<key>calendarUserAddresses</key>\
<array>\
<string>%(principaluri)s</string>\
<string>mailto:%(email)s</string>\
<string>urn:uuid:%(guid)s</string>\
</array>\
<key>principalPath</key>\
<string>/principals/__uuids__/%(guid)s/</string>\
</dict>\
</dict>\
</dict>\
<key>serviceType</key>\
<array>\
<string>calendar</string>\
</array>\
</dict>\
</dict>\
</dict>\
</plist>",
        guid = VIRTUALHOST_GUID,
        host = host_name
    )
}
