pub mod config;
pub mod directory;
pub mod filter;
pub mod ldap_handler;
pub mod ldap_protocol;
pub mod server;
pub mod tls;

pub use config::AppConfig;
pub use ldap_handler::LdapHandler;
pub use server::LdapServer;
