//! In-memory directory view: users and groups flattened into a uniform entry
//! shape with the synthesized AD attributes search responses are built from.

use crate::config::AppConfig;
use std::collections::BTreeMap;

/// One searchable object, group or user.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub cn: String,
    pub object_class: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    pub member_of: Vec<String>,
    /// Users carry their userAccountControl bitmask; groups have none.
    pub user_account_control: Option<i32>,
}

/// Build the full entry list: all groups in configuration order, then all
/// users in configuration order. Cheap for the intended database sizes, so
/// it is recomputed per search request.
pub fn join_groups_and_users(config: &AppConfig) -> Vec<DirectoryEntry> {
    let domain = &config.configuration.domain;
    let mut entries = Vec::with_capacity(config.groups.len() + config.users.len());

    for group in &config.groups {
        let mut attributes = BTreeMap::new();
        attributes.insert("name".to_string(), group.cn.clone());
        entries.push(DirectoryEntry {
            cn: group.cn.clone(),
            object_class: vec!["top".to_string(), "group".to_string()],
            attributes,
            member_of: Vec::new(),
            user_account_control: None,
        });
    }

    for user in &config.users {
        let member_of = user
            .groups
            .iter()
            .map(|g| create_object_name(g, "CN=Users", domain))
            .collect();
        entries.push(DirectoryEntry {
            cn: user.cn.clone(),
            object_class: vec![
                "top".to_string(),
                "person".to_string(),
                "organizationalPerson".to_string(),
                "user".to_string(),
            ],
            attributes: user.attributes.clone(),
            member_of,
            user_account_control: Some(user.user_account_control),
        });
    }

    entries
}

/// Build a distinguished name from a CN, a container prefix and the dotted
/// domain: `CN=<cn>,<prefix>,DC=<part>,...`. Values are inserted verbatim;
/// this subset does no RDN escaping.
pub fn create_object_name(cn: &str, prefix: &str, domain: &str) -> String {
    let mut object_name = format!("CN={},{}", cn, prefix);
    for part in domain.split('.') {
        object_name.push_str(",DC=");
        object_name.push_str(part);
    }
    object_name
}

/// Check a search base against the configured domain.
///
/// Only `dc=` components of the base participate; other RDNs are skipped, and
/// a base without any DC components is accepted. Returns 0 on match, 1 when
/// the configured domain is too short or one of the first two DC components
/// mismatches (referral), 2 on a mismatch after the first two matched (no
/// such object).
pub fn test_domain(base_object: &str, domain: &str) -> u8 {
    let mut domain_parts: Vec<&str> = domain.split('.').collect();
    domain_parts.reverse();
    if domain_parts.len() < 2 {
        return 1;
    }

    let mut base_parts: Vec<&str> = base_object.split(',').collect();
    base_parts.reverse();

    let mut d_idx = 0;
    for part in base_parts {
        let part = part.trim();
        if !part.as_bytes().get(..3).is_some_and(|p| p.eq_ignore_ascii_case(b"dc=")) {
            continue;
        }

        if d_idx >= domain_parts.len() || !part[3..].eq_ignore_ascii_case(domain_parts[d_idx]) {
            if d_idx < 2 {
                return 1;
            }
            return 2;
        }

        d_idx += 1;
    }

    0
}
