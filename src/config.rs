use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Default and upper bound for the number of entries one search returns.
pub const DEFAULT_MAX_SIZE_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    /// Host name advertised to remote clients in the Apple computer record.
    /// Loopback clients always see "localhost".
    pub host_name: Option<String>,
    #[serde(default)]
    pub search: SearchConfig,
    /// Optional HTTP listen address for metrics and health (e.g. "0.0.0.0:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness).
    pub metrics_listen: Option<String>,
    /// Users of the built-in directory. Each one is a GAL entry and can bind.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Size limit used when a client asks for 0 (unlimited) or more than this.
    #[serde(default = "default_max_size_limit")]
    pub max_size_limit: usize,
}

fn default_max_size_limit() -> usize {
    DEFAULT_MAX_SIZE_LIMIT
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_size_limit: DEFAULT_MAX_SIZE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub mail: Option<String>,
    /// Extra properties, keyed by backend property name (e.g. telephoneNumber).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Personal address book of this user.
    #[serde(default)]
    pub contacts: Vec<ContactConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactConfig {
    /// Numeric contact id, unique within the owner's address book.
    pub id: u64,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub mail: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.search.max_size_limit == 0 {
            bail!("search.max_size_limit must be at least 1");
        }
        let mut names = std::collections::HashSet::new();
        for user in &self.users {
            if user.name.is_empty() {
                bail!("users: user name must not be empty");
            }
            if !names.insert(user.name.as_str()) {
                bail!("users: duplicate user {}", user.name);
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:1389".to_string(),
            },
            host_name: None,
            search: SearchConfig::default(),
            metrics_listen: None,
            users: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen.url, "ldap://127.0.0.1:1389");
        assert_eq!(config.search.max_size_limit, 100);
        assert!(config.host_name.is_none());
        assert!(config.metrics_listen.is_none());
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
listen:
  url: "ldap://0.0.0.0:389"
host_name: "gal.example.com"
search:
  max_size_limit: 50
metrics_listen: "127.0.0.1:9090"
users:
  - name: "jsmith"
    password: "secret"
    given_name: "John"
    surname: "Smith"
    mail: "jsmith@example.com"
    attributes:
      telephoneNumber: "+1 555 0100"
    contacts:
      - id: 42
        given_name: "Jane"
        surname: "Doe"
        mail: "jane@example.org"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.url, "ldap://0.0.0.0:389");
        assert_eq!(config.host_name.as_deref(), Some("gal.example.com"));
        assert_eq!(config.search.max_size_limit, 50);
        assert_eq!(config.metrics_listen.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(config.users.len(), 1);
        let user = &config.users[0];
        assert_eq!(user.given_name.as_deref(), Some("John"));
        assert_eq!(user.attributes.get("telephoneNumber").map(String::as_str), Some("+1 555 0100"));
        assert_eq!(user.contacts[0].id, 42);
        assert_eq!(user.contacts[0].surname.as_deref(), Some("Doe"));
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
listen:
  url: "ldap://:1389"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.search.max_size_limit, DEFAULT_MAX_SIZE_LIMIT);
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
listen:
  url: "ldap://127.0.0.1:1389"
users:
  - name: "bbrown"
    password: "pw"
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.users[0].name, "bbrown");
        assert!(config.users[0].contacts.is_empty());
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        let yaml = "invalid: yaml: content: [";
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
    }

    #[test]
    fn test_config_rejects_duplicate_users() {
        let yaml = r#"
listen:
  url: "ldap://127.0.0.1:1389"
users:
  - name: "jsmith"
    password: "a"
  - name: "jsmith"
    password: "b"
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_rejects_zero_size_limit() {
        let yaml = r#"
listen:
  url: "ldap://127.0.0.1:1389"
search:
  max_size_limit: 0
"#;
        assert!(Config::from_str(yaml).is_err());
    }
}
