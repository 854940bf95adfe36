use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// userAccountControl bits (AD bitmask semantics).
pub const UAC_ACCOUNT_DISABLED: i32 = 0x0002;
pub const UAC_NORMAL_ACCOUNT: i32 = 0x0200;
pub const UAC_DONT_EXPIRE_PASSWORD: i32 = 0x0001_0000;

const DEFAULT_LDAP_PORT: u16 = 389;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    pub port: i32,
    pub crt_file: String,
    pub key_file: String,
    pub user_file: String,
    pub group_file: String,
    pub domain: String,
    /// Derived at load time: both PEM files are set and exist on disk.
    #[serde(skip)]
    pub use_tls: bool,
}

impl Configuration {
    /// Listen port with the LDAP default applied for absent or invalid values.
    pub fn effective_port(&self) -> u16 {
        if self.port <= 0 || self.port > u16::MAX as i32 {
            DEFAULT_LDAP_PORT
        } else {
            self.port as u16
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub cn: String,
    pub upn: String,
    pub password: String,
    #[serde(default)]
    pub password_never_expire: bool,
    #[serde(default)]
    pub account_disabled: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Computed from the flags at load time, never read from the file.
    #[serde(skip)]
    pub user_account_control: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub cn: String,
}

/// Full application state: listener settings plus the user/group database.
/// Built once at startup and shared read-only across connection workers.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub configuration: Configuration,
    pub users: Vec<User>,
    pub groups: Vec<Group>,
}

impl AppConfig {
    /// Load the main configuration file, then the user and group databases it
    /// points at. All load failures here are fatal for the process.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read configuration file {}", path.display()))?;
        let mut configuration: Configuration =
            serde_json::from_str(&content).context("Parse configuration JSON")?;

        configuration.use_tls = !configuration.crt_file.is_empty()
            && !configuration.key_file.is_empty()
            && Path::new(&configuration.crt_file).exists()
            && Path::new(&configuration.key_file).exists();

        let users = load_users(&configuration.user_file)?;
        let groups = load_groups(&configuration.group_file)?;

        Self::assemble(configuration, users, groups)
    }

    /// Validate group references and fill in the derived user fields.
    /// Separated from `load` so tests can build configs without touching disk.
    pub fn assemble(
        configuration: Configuration,
        mut users: Vec<User>,
        groups: Vec<Group>,
    ) -> Result<Self> {
        for user in &mut users {
            for group in &user.groups {
                if !groups.iter().any(|g| g.cn == *group) {
                    bail!("User {} references unknown group {}", user.upn, group);
                }
            }

            user.attributes.insert("name".to_string(), user.cn.clone());
            user.attributes
                .insert("userPrincipalName".to_string(), user.upn.clone());

            let mut uac = UAC_NORMAL_ACCOUNT;
            if user.account_disabled {
                uac |= UAC_ACCOUNT_DISABLED;
            }
            if user.password_never_expire {
                uac |= UAC_DONT_EXPIRE_PASSWORD;
            }
            user.user_account_control = uac;
        }

        Ok(Self {
            configuration,
            users,
            groups,
        })
    }
}

fn load_users(path: &str) -> Result<Vec<User>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Read user file {}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Parse user file {}", path))
}

fn load_groups(path: &str) -> Result<Vec<Group>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Read group file {}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Parse group file {}", path))
}
