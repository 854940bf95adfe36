//! Bind, search and delete handlers. Handlers are socket-free: they take a
//! parsed request plus session state and return the response messages for the
//! session layer to write.

use crate::config::AppConfig;
use crate::directory::{create_object_name, join_groups_and_users, test_domain};
use crate::filter::filter_entries;
use crate::ldap_protocol::{
    Attribute, BindRequest, DelRequest, LdapMessage, LdapResult, ProtocolOp, SearchRequest,
    SearchResultEntry,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

// AD-specific diagnostic strings. Clients match on these verbatim.
pub const DIAG_INVALID_CREDENTIALS: &str =
    "80090308: LdapErr: DSID-0C090569, comment: AcceptSecurityContext error, data 52e, v4563";
pub const DIAG_ACCOUNT_DISABLED: &str =
    "80090308: LdapErr: DSID-0C090569, comment: AcceptSecurityContext error, data 533, v4563";
pub const DIAG_BIND_REQUIRED: &str = "000004DC: LdapErr: DSID-0C090CF4, comment: In order to \
     perform this operation a successful bind must be completed on the connection., data 0, v4563";
pub const DIAG_REFERRAL: &str = "0000202B: RefErr: DSID-0310084A, data 0, 1 access points";
pub const DIAG_NO_OBJECT: &str =
    "0000208D: NameErr: DSID-0310028C, problem 2001 (NO_OBJECT), data 0, best match of:";

/// Result of a bind attempt. `response` is None when the request is dropped
/// without an answer (unsupported protocol version).
pub struct BindOutcome {
    pub response: Option<LdapResult>,
    pub bound: bool,
}

pub struct LdapHandler {
    config: Arc<AppConfig>,
}

impl LdapHandler {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Simple bind against the user database, lookup by lowercased UPN.
    pub fn handle_bind(&self, request: &BindRequest) -> BindOutcome {
        if request.version != 3 {
            warn!("Unsupported LDAP version {}", request.version);
            return BindOutcome {
                response: None,
                bound: false,
            };
        }

        let name = request.name.to_lowercase();

        // AD answers an empty password with success (anonymous bind) even for
        // unknown users; the error surfaces on the first search instead.
        if request.password.is_empty() {
            debug!("Anonymous bind for {:?}", name);
            return BindOutcome {
                response: Some(LdapResult::success()),
                bound: false,
            };
        }

        let user = self
            .config
            .users
            .iter()
            .find(|u| u.upn.to_lowercase() == name);

        match user {
            Some(user) if user.password.as_bytes() == request.password.as_slice() => {
                if user.account_disabled {
                    info!("Bind rejected for {:?}: account disabled", name);
                    BindOutcome {
                        response: Some(LdapResult::new(49, DIAG_ACCOUNT_DISABLED)),
                        bound: false,
                    }
                } else {
                    info!("Bind successful for {:?}", name);
                    BindOutcome {
                        response: Some(LdapResult::success()),
                        bound: true,
                    }
                }
            }
            _ => {
                info!("Bind rejected for {:?}: invalid credentials", name);
                BindOutcome {
                    response: Some(LdapResult::new(49, DIAG_INVALID_CREDENTIALS)),
                    bound: false,
                }
            }
        }
    }

    /// Search over the joined group/user entries. Returns the entry messages
    /// followed by exactly one SearchResultDone.
    pub fn handle_search(
        &self,
        message_id: u8,
        request: &SearchRequest,
        bind_successful: bool,
    ) -> Vec<LdapMessage> {
        let done = |result: LdapResult| LdapMessage {
            message_id,
            protocol_op: ProtocolOp::SearchResultDone(result),
        };

        if !bind_successful {
            debug!("Search without a successful bind");
            return vec![done(LdapResult::new(1, DIAG_BIND_REQUIRED))];
        }

        let domain = &self.config.configuration.domain;
        match test_domain(&request.base_object, domain) {
            0 => {}
            1 => {
                debug!("Search base {:?} referred away from {:?}", request.base_object, domain);
                return vec![done(LdapResult::new(10, DIAG_REFERRAL))];
            }
            _ => {
                debug!("Search base {:?} not found under {:?}", request.base_object, domain);
                return vec![done(LdapResult::new(32, DIAG_NO_OBJECT))];
            }
        }

        let entries = filter_entries(join_groups_and_users(&self.config), &request.filter);
        debug!("Search base {:?} matched {} entries", request.base_object, entries.len());

        let mut messages = Vec::with_capacity(entries.len() + 1);
        for entry in entries {
            let object_name = create_object_name(&entry.cn, "CN=Users", domain);

            let mut attributes =
                vec![Attribute::new("objectClass", entry.object_class.clone())];
            for (key, value) in &entry.attributes {
                attributes.push(Attribute::new(key, vec![value.clone()]));
            }
            attributes.push(Attribute::new("cn", vec![entry.cn.clone()]));
            if !entry.member_of.is_empty() {
                attributes.push(Attribute::new("memberOf", entry.member_of.clone()));
            }
            if let Some(uac) = entry.user_account_control {
                if uac > 0 {
                    attributes.push(Attribute::new("userAccountControl", vec![uac.to_string()]));
                }
            }

            messages.push(LdapMessage {
                message_id,
                protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
                    object_name,
                    attributes,
                }),
            });
        }

        messages.push(done(LdapResult::success()));
        messages
    }

    /// Deletes are accepted and acknowledged but never applied; the database
    /// is read-only for the lifetime of the process.
    pub fn handle_delete(&self, request: &DelRequest) -> LdapResult {
        info!("Delete request for {:?} ignored (read-only database)", request.dn);
        LdapResult::success()
    }
}
