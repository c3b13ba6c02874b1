//! Connection configuration.
//!
//! Grounded on `sqlx_core::mysql::options::MySqlConnectOptions`: a plain data
//! record constructed through a builder, validated only where a setter can
//! cheaply clamp a bad value, with `Default` supplying sane constants for
//! everything else.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The TCP-handshake timeout used when `connect_tcp_timeout` is unset.
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// `callback_delay_micros_avg() >= this` marks the event loop as "stalled"
/// for timeout-cause attribution.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_millis(50);

/// A compression codec negotiated with the server. The codec implementation
/// itself is an external collaborator (out of scope); this only names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compression(pub String);

/// How `ConnectOperation::enable_change_user` should behave once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeUserMode {
    /// Never issue `COM_CHANGE_USER`.
    #[default]
    Disabled,
    /// Issue `COM_CHANGE_USER` once the initial handshake succeeds, adopting
    /// the key passed to `enable_change_user`.
    Enabled,
}

/// Supplies TLS configuration to the handler. TLS bindings themselves are an
/// external collaborator; this is just the seam the
/// engine calls through.
pub trait SslOptionsProvider: Send + Sync {
    /// Opaque, handler-specific SSL context/options blob.
    fn ssl_options(&self) -> Box<dyn Any + Send>;
}

/// Context passed to a [`CertValidationCallback`].
pub struct CertValidationContext<'a> {
    /// The raw certificate bytes (DER), handed through from the handler.
    pub certificate_der: &'a [u8],
    /// `true` when the operation itself should be used as the callback's
    /// context identity (mirroring a C driver's "pass the operation
    /// pointer as context" convention). When `false`, `user_context`
    /// carries whatever the caller supplied to `cert_validation_callback`.
    pub use_operation_as_context: bool,
    pub user_context: Option<&'a (dyn Any + Send + Sync)>,
}

/// `true` on success; `Err(message)` on failure. Wrapped by
/// `ConnectOperation` before it reaches the handler, so a callback that
/// outlives the operation it was registered for fails safely instead of
/// running stale logic.
pub type CertValidationCallback =
    Arc<dyn Fn(CertValidationContext<'_>) -> Result<(), String> + Send + Sync>;

/// Configuration record shared by every operation placed on a
/// [`Connection`][crate::connection::Connection].
///
/// Mutable only while the owning operation is
/// [`OperationState::Unstarted`][crate::operation::OperationState::Unstarted];
/// `ConnectOperation`'s setters enforce this by returning
/// [`Error::InvalidState`][crate::error::Error::InvalidState] once `run()`
/// has been called.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
    pub query_timeout: Option<Duration>,
    pub connect_tcp_timeout: Option<Duration>,
    pub connect_attempts: u32,
    pub attributes: BTreeMap<String, String>,
    pub compression: Option<Compression>,
    pub ssl_options_provider: Option<Arc<dyn SslOptionsProvider>>,
    pub sni_server_name: Option<String>,
    pub dscp: Option<u8>,
    pub cert_validation_callback: Option<CertValidationCallback>,
    pub reset_conn_before_close: bool,
    pub delayed_reset_conn: bool,
    pub change_user_mode: ChangeUserMode,
    /// Dispatch `kill_running_query` on the resulting connection's handler
    /// the next time one of its operations ends in `TimedOut`.
    pub kill_on_query_timeout: bool,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("timeout", &self.timeout)
            .field("total_timeout", &self.total_timeout)
            .field("query_timeout", &self.query_timeout)
            .field("connect_tcp_timeout", &self.connect_tcp_timeout)
            .field("connect_attempts", &self.connect_attempts)
            .field("attributes", &self.attributes)
            .field("compression", &self.compression)
            .field("sni_server_name", &self.sni_server_name)
            .field("dscp", &self.dscp)
            .field("reset_conn_before_close", &self.reset_conn_before_close)
            .field("delayed_reset_conn", &self.delayed_reset_conn)
            .field("change_user_mode", &self.change_user_mode)
            .field("kill_on_query_timeout", &self.kill_on_query_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            total_timeout: None,
            query_timeout: None,
            connect_tcp_timeout: None,
            connect_attempts: 1,
            attributes: BTreeMap::new(),
            compression: None,
            ssl_options_provider: None,
            sni_server_name: None,
            dscp: None,
            cert_validation_callback: None,
            reset_conn_before_close: false,
            delayed_reset_conn: false,
            change_user_mode: ChangeUserMode::Disabled,
            kill_on_query_timeout: false,
        }
    }
}

impl ConnectionOptions {
    pub fn builder() -> ConnectionOptionsBuilder {
        ConnectionOptionsBuilder::default()
    }

    /// The TCP-handshake deadline to arm: `connect_tcp_timeout` if set,
    /// else [`DEFAULT_TCP_TIMEOUT`]. A zero duration disables the
    /// sub-timeout entirely.
    pub fn tcp_timeout_or_default(&self) -> Duration {
        self.connect_tcp_timeout.unwrap_or(DEFAULT_TCP_TIMEOUT)
    }

    /// Per-attempt timeout clamped to the remaining total-timeout budget at
    /// arming time: a per-attempt timeout may not exceed what's left of
    /// `total_timeout`.
    pub fn attempt_timeout_clamped(&self, elapsed: Duration) -> Option<Duration> {
        match (self.timeout, self.total_timeout) {
            (Some(per_attempt), Some(total)) => {
                let remaining = total.saturating_sub(elapsed);
                Some(per_attempt.min(remaining))
            }
            (per_attempt, None) => per_attempt,
            (None, Some(total)) => Some(total.saturating_sub(elapsed)),
        }
    }
}

/// Builder for [`ConnectionOptions`], following the fluent `with_*`/`enable_*`
/// convention `ConnectOperation`'s own setters use.
#[derive(Default)]
pub struct ConnectionOptionsBuilder {
    options: ConnectionOptions,
}

impl From<ConnectionOptions> for ConnectionOptionsBuilder {
    fn from(options: ConnectionOptions) -> Self {
        Self { options }
    }
}

impl ConnectionOptionsBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.options.total_timeout = Some(timeout);
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.options.query_timeout = Some(timeout);
        self
    }

    pub fn connect_tcp_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_tcp_timeout = Some(timeout);
        self
    }

    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.options.connect_attempts = attempts.max(1);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.attributes.insert(key.into(), value.into());
        self
    }

    pub fn compression(mut self, codec: impl Into<String>) -> Self {
        self.options.compression = Some(Compression(codec.into()));
        self
    }

    pub fn ssl_options_provider(mut self, provider: Arc<dyn SslOptionsProvider>) -> Self {
        self.options.ssl_options_provider = Some(provider);
        self
    }

    pub fn sni_server_name(mut self, name: impl Into<String>) -> Self {
        self.options.sni_server_name = Some(name.into());
        self
    }

    pub fn dscp(mut self, value: u8) -> Self {
        self.options.dscp = Some(value.min(63));
        self
    }

    pub fn cert_validation_callback(mut self, callback: CertValidationCallback) -> Self {
        self.options.cert_validation_callback = Some(callback);
        self
    }

    pub fn reset_conn_before_close(mut self, enabled: bool) -> Self {
        self.options.reset_conn_before_close = enabled;
        self
    }

    pub fn delayed_reset_conn(mut self, enabled: bool) -> Self {
        self.options.delayed_reset_conn = enabled;
        self
    }

    pub fn change_user_mode(mut self, mode: ChangeUserMode) -> Self {
        self.options.change_user_mode = mode;
        self
    }

    pub fn kill_on_query_timeout(mut self, enabled: bool) -> Self {
        self.options.kill_on_query_timeout = enabled;
        self
    }

    pub fn build(self) -> ConnectionOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_timeout_is_clamped_to_total_budget() {
        let options = ConnectionOptions::builder()
            .timeout(Duration::from_secs(10))
            .total_timeout(Duration::from_secs(5))
            .build();

        // Nothing elapsed yet: clamp kicks in because per-attempt > total.
        assert_eq!(
            options.attempt_timeout_clamped(Duration::ZERO),
            Some(Duration::from_secs(5))
        );

        // After 4s elapsed, only 1s of total budget remains.
        assert_eq!(
            options.attempt_timeout_clamped(Duration::from_secs(4)),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn tcp_timeout_defaults_when_unset() {
        let options = ConnectionOptions::default();
        assert_eq!(options.tcp_timeout_or_default(), DEFAULT_TCP_TIMEOUT);
    }

    #[test]
    fn dscp_is_clamped_to_valid_range() {
        let options = ConnectionOptions::builder().dscp(200).build();
        assert_eq!(options.dscp, Some(63));
    }
}
