//! Search filter evaluation against directory entries.

use crate::directory::DirectoryEntry;
use crate::ldap_protocol::Filter;
use tracing::warn;

impl Filter {
    /// True when the tree contains a structure the evaluator cannot
    /// interpret. Such filters degrade to pass-through rather than dropping
    /// results a client may depend on.
    pub fn has_unsupported(&self) -> bool {
        match self {
            Filter::Unsupported(_) => true,
            Filter::And(children) | Filter::Or(children) => {
                children.iter().any(Filter::has_unsupported)
            }
            _ => false,
        }
    }

    fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Filter::Absent => true,
            Filter::Equality { attribute, value } => {
                if attribute == "objectclass" {
                    entry
                        .object_class
                        .iter()
                        .any(|class| class.eq_ignore_ascii_case(value))
                } else {
                    entry
                        .attributes
                        .iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(attribute))
                        .is_some_and(|(_, v)| v.to_lowercase() == *value)
                }
            }
            Filter::And(children) => children.iter().all(|child| child.matches(entry)),
            Filter::Or(children) => children.iter().any(|child| child.matches(entry)),
            // Unreachable through filter_entries; a lone unsupported node
            // matches nothing.
            Filter::Unsupported(_) => false,
        }
    }
}

/// Apply a parsed filter to the joined entry list.
pub fn filter_entries(entries: Vec<DirectoryEntry>, filter: &Filter) -> Vec<DirectoryEntry> {
    if filter.has_unsupported() {
        warn!("Unsupported search filter structure {:?}, returning all entries", filter);
        return entries;
    }
    entries
        .into_iter()
        .filter(|entry| filter.matches(entry))
        .collect()
}
