//! Connection identity.

use std::collections::BTreeMap;
use std::sync::Arc;

/// The immutable identity of a connection: host/port or Unix socket, the
/// authenticating user and database, and any extra attributes that
/// participate in equality (e.g. a charset or timezone override).
///
/// Cheap to clone: the payload lives behind an [`Arc`], so sharing a key
/// across many in-flight [`ConnectOperation`][crate::operation::connect::ConnectOperation]s
/// does not duplicate the strings. Interning (deduplicating identical keys
/// across a whole process) is left to a caller-supplied pool; this type only
/// guarantees correct, cheap equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey(Arc<ConnectionKeyInner>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnectionKeyInner {
    host: String,
    port: u16,
    unix_socket_path: Option<String>,
    user: String,
    database: String,
    password_hash: Vec<u8>,
    extra: BTreeMap<String, String>,
}

impl ConnectionKey {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, database: impl Into<String>) -> Self {
        Self(Arc::new(ConnectionKeyInner {
            host: host.into(),
            port,
            unix_socket_path: None,
            user: user.into(),
            database: database.into(),
            password_hash: Vec::new(),
            extra: BTreeMap::new(),
        }))
    }

    pub fn with_unix_socket_path(mut self, path: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.0).unix_socket_path = Some(path.into());
        self
    }

    pub fn with_password_hash(mut self, hash: Vec<u8>) -> Self {
        Arc::make_mut(&mut self.0).password_hash = hash;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.0).extra.insert(key.into(), value.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.0.host
    }

    pub fn port(&self) -> u16 {
        self.0.port
    }

    pub fn unix_socket_path(&self) -> Option<&str> {
        self.0.unix_socket_path.as_deref()
    }

    pub fn user(&self) -> &str {
        &self.0.user
    }

    pub fn database(&self) -> &str {
        &self.0.database
    }

    pub fn is_unix_socket(&self) -> bool {
        self.0.unix_socket_path.is_some()
    }

    /// A short, loggable identifier: `host:port` or `unix:<path>`.
    pub fn display_endpoint(&self) -> String {
        match &self.0.unix_socket_path {
            Some(path) => format!("unix:{path}"),
            None => format!("{}:{}", self.0.host, self.0.port),
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.user(), self.display_endpoint(), self.database())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_compare_equal() {
        let a = ConnectionKey::new("db.internal", 3306, "app", "app_db");
        let b = ConnectionKey::new("db.internal", 3306, "app", "app_db");
        assert_eq!(a, b);
    }

    #[test]
    fn differing_field_breaks_equality() {
        let a = ConnectionKey::new("db.internal", 3306, "app", "app_db");
        let b = ConnectionKey::new("db.internal", 3307, "app", "app_db");
        assert_ne!(a, b);
    }

    #[test]
    fn unix_socket_path_participates_in_display() {
        let key = ConnectionKey::new("ignored", 0, "app", "app_db")
            .with_unix_socket_path("/var/run/mysqld/mysqld.sock");
        assert!(key.is_unix_socket());
        assert_eq!(key.display_endpoint(), "unix:/var/run/mysqld/mysqld.sock");
    }
}
