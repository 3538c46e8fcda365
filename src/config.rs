//! Property-driven configuration for the session bindings.
//!
//! Settings are read from a flat [`Properties`] set using the
//! `conf.comm.*` keys and can be overridden with fluent `with_*` methods.
//!
//! # Example
//!
//! ```ignore
//! use resumable_session::{Properties, RtcpConfig};
//!
//! let props: Properties = "conf.comm.rtcpbacklog = 128000".parse()?;
//! let config = RtcpConfig::from_properties(&props)?
//!     .with_disconnected_timeout(Duration::from_secs(10));
//! ```
//!
//! # Keys
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `conf.comm.rtcptimeout[.debug]` | 60 s | RTCP session inactivity timeout |
//! | `conf.comm.rtcpdisconntimeout[.debug]` | 30 s | RTCP disconnected grace period |
//! | `conf.comm.rtcpbacklog` | 64000 | RTCP unacknowledged byte limit |
//! | `conf.comm.httpselectwait[.debug]` | 60 s | HTTP select wait before empty reply |
//! | `conf.comm.httptimeout[.debug]` | 15 s | HTTP session inactivity timeout |
//! | `<prefix>.root` | `""` | HTTP root URI |

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::MessageFormat;

// ============================================================================
// Constants
// ============================================================================

/// Default RTCP inactivity timeout, in seconds.
const DEFAULT_RTCP_INACTIVITY_SECS: u64 = 60;

/// Default RTCP disconnected grace period, in seconds.
const DEFAULT_RTCP_DISCONNECTED_SECS: u64 = 30;

/// Default RTCP backlog limit, in bytes.
const DEFAULT_RTCP_BACKLOG_LIMIT: usize = 64_000;

/// Default HTTP select wait, in seconds.
const DEFAULT_HTTP_SELECT_SECS: u64 = 60;

/// Default HTTP session inactivity timeout, in seconds.
const DEFAULT_HTTP_SESSION_SECS: u64 = 15;

/// Extra slack added to periodic tick periods.
const TICK_SLACK: Duration = Duration::from_secs(1);

// ============================================================================
// Properties
// ============================================================================

/// Flat `key = value` property set.
///
/// Blank lines and lines starting with `#` or `!` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: FxHashMap<String, String>,
}

impl Properties {
    /// Creates an empty property set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads properties from a file.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    /// - [`Error::Config`] if a line is not a `key = value` pair
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let props: Self = text.parse()?;
        debug!(path = %path.display(), count = props.len(), "Properties loaded");
        Ok(props)
    }

    /// Sets a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Returns the raw value of a property.
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns the number of properties.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if no properties are set.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reads an integer property.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the value is present but not an integer.
    pub fn int_property(&self, key: &str, default: i64) -> Result<i64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("{key}: expected an integer, got {raw:?}"))),
        }
    }

    /// Reads a non-negative size property.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the value is not a non-negative integer.
    pub fn size_property(&self, key: &str, default: usize) -> Result<usize> {
        let value = self.int_property(key, default as i64)?;
        usize::try_from(value)
            .map_err(|_| Error::config(format!("{key}: must not be negative, got {value}")))
    }

    /// Reads a duration property given in whole seconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the value is not a non-negative integer.
    pub fn duration_secs(&self, key: &str, default_secs: u64) -> Result<Duration> {
        let secs = self.int_property(key, default_secs as i64)?;
        u64::try_from(secs)
            .map(Duration::from_secs)
            .map_err(|_| Error::config(format!("{key}: must not be negative, got {secs}")))
    }
}

impl FromStr for Properties {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut props = Self::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::config(format!("line {}: expected key = value", number + 1))
            })?;
            props.set(key.trim(), value.trim());
        }
        Ok(props)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Self::new();
        for (key, value) in iter {
            props.set(key, value);
        }
        props
    }
}

// ============================================================================
// RtcpConfig
// ============================================================================

/// Timeouts and limits for RTCP sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpConfig {
    /// Idle time after which a session is closed.
    pub inactivity_timeout: Duration,

    /// Inactivity timeout in debug mode.
    pub debug_inactivity_timeout: Duration,

    /// Time a session may stay without a connection before it is closed.
    pub disconnected_timeout: Duration,

    /// Disconnected timeout in debug mode.
    pub debug_disconnected_timeout: Duration,

    /// Unacknowledged outbound bytes tolerated before a session is closed.
    pub backlog_limit: usize,

    /// How message blocks are unpacked.
    pub message_format: MessageFormat,
}

impl Default for RtcpConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(DEFAULT_RTCP_INACTIVITY_SECS),
            debug_inactivity_timeout: Duration::from_secs(DEFAULT_RTCP_INACTIVITY_SECS),
            disconnected_timeout: Duration::from_secs(DEFAULT_RTCP_DISCONNECTED_SECS),
            debug_disconnected_timeout: Duration::from_secs(DEFAULT_RTCP_DISCONNECTED_SECS),
            backlog_limit: DEFAULT_RTCP_BACKLOG_LIMIT,
            message_format: MessageFormat::Json,
        }
    }
}

impl RtcpConfig {
    /// Reads the `conf.comm.rtcp*` keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any present value is invalid.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        Ok(Self {
            inactivity_timeout: props
                .duration_secs("conf.comm.rtcptimeout", DEFAULT_RTCP_INACTIVITY_SECS)?,
            debug_inactivity_timeout: props
                .duration_secs("conf.comm.rtcptimeout.debug", DEFAULT_RTCP_INACTIVITY_SECS)?,
            disconnected_timeout: props
                .duration_secs("conf.comm.rtcpdisconntimeout", DEFAULT_RTCP_DISCONNECTED_SECS)?,
            debug_disconnected_timeout: props.duration_secs(
                "conf.comm.rtcpdisconntimeout.debug",
                DEFAULT_RTCP_DISCONNECTED_SECS,
            )?,
            backlog_limit: props.size_property("conf.comm.rtcpbacklog", DEFAULT_RTCP_BACKLOG_LIMIT)?,
            message_format: MessageFormat::Json,
        })
    }

    /// Sets the inactivity timeout.
    #[inline]
    #[must_use]
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Sets the debug-mode inactivity timeout.
    #[inline]
    #[must_use]
    pub fn with_debug_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.debug_inactivity_timeout = timeout;
        self
    }

    /// Sets the disconnected grace period.
    #[inline]
    #[must_use]
    pub fn with_disconnected_timeout(mut self, timeout: Duration) -> Self {
        self.disconnected_timeout = timeout;
        self
    }

    /// Sets the debug-mode disconnected grace period.
    #[inline]
    #[must_use]
    pub fn with_debug_disconnected_timeout(mut self, timeout: Duration) -> Self {
        self.debug_disconnected_timeout = timeout;
        self
    }

    /// Sets the backlog limit in bytes.
    #[inline]
    #[must_use]
    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit;
        self
    }

    /// Sets the inbound message format.
    #[inline]
    #[must_use]
    pub fn with_message_format(mut self, format: MessageFormat) -> Self {
        self.message_format = format;
        self
    }

    /// Inactivity timeout for the given mode.
    #[inline]
    #[must_use]
    pub fn inactivity_timeout(&self, debug: bool) -> Duration {
        if debug {
            self.debug_inactivity_timeout
        } else {
            self.inactivity_timeout
        }
    }

    /// Disconnected grace period for the given mode.
    #[inline]
    #[must_use]
    pub fn disconnected_timeout(&self, debug: bool) -> Duration {
        if debug {
            self.debug_disconnected_timeout
        } else {
            self.disconnected_timeout
        }
    }

    /// Period of the inactivity clock, fixed when a session is created.
    #[inline]
    #[must_use]
    pub fn inactivity_tick_period(&self) -> Duration {
        self.inactivity_timeout / 2 + TICK_SLACK
    }

    /// Time a fresh connection gets to send its first request.
    #[inline]
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        self.inactivity_timeout
    }
}

// ============================================================================
// HttpConfig
// ============================================================================

/// Timeouts and routing for HTTP long-poll sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Root URI prefix for all session URIs (without slashes).
    pub root_uri: String,

    /// Time a select may wait before an empty reply is forced.
    pub select_timeout: Duration,

    /// Select wait in debug mode.
    pub debug_select_timeout: Duration,

    /// Idle time after which a session is closed.
    pub session_timeout: Duration,

    /// Session timeout in debug mode.
    pub debug_session_timeout: Duration,

    /// How `xmit` bodies are unpacked.
    pub message_format: MessageFormat,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            root_uri: String::new(),
            select_timeout: Duration::from_secs(DEFAULT_HTTP_SELECT_SECS),
            debug_select_timeout: Duration::from_secs(DEFAULT_HTTP_SELECT_SECS),
            session_timeout: Duration::from_secs(DEFAULT_HTTP_SESSION_SECS),
            debug_session_timeout: Duration::from_secs(DEFAULT_HTTP_SESSION_SECS),
            message_format: MessageFormat::Json,
        }
    }
}

impl HttpConfig {
    /// Reads the `conf.comm.http*` keys and `<prop_root>.root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any present value is invalid.
    pub fn from_properties(props: &Properties, prop_root: &str) -> Result<Self> {
        Ok(Self {
            root_uri: props
                .get(&format!("{prop_root}.root"))
                .unwrap_or_default()
                .to_owned(),
            select_timeout: props
                .duration_secs("conf.comm.httpselectwait", DEFAULT_HTTP_SELECT_SECS)?,
            debug_select_timeout: props
                .duration_secs("conf.comm.httpselectwait.debug", DEFAULT_HTTP_SELECT_SECS)?,
            session_timeout: props
                .duration_secs("conf.comm.httptimeout", DEFAULT_HTTP_SESSION_SECS)?,
            debug_session_timeout: props
                .duration_secs("conf.comm.httptimeout.debug", DEFAULT_HTTP_SESSION_SECS)?,
            message_format: MessageFormat::Json,
        })
    }

    /// Sets the root URI.
    #[inline]
    #[must_use]
    pub fn with_root_uri(mut self, root: impl Into<String>) -> Self {
        self.root_uri = root.into();
        self
    }

    /// Sets the select wait.
    #[inline]
    #[must_use]
    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    /// Sets the debug-mode select wait.
    #[inline]
    #[must_use]
    pub fn with_debug_select_timeout(mut self, timeout: Duration) -> Self {
        self.debug_select_timeout = timeout;
        self
    }

    /// Sets the session inactivity timeout.
    #[inline]
    #[must_use]
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the debug-mode session inactivity timeout.
    #[inline]
    #[must_use]
    pub fn with_debug_session_timeout(mut self, timeout: Duration) -> Self {
        self.debug_session_timeout = timeout;
        self
    }

    /// Sets the inbound message format.
    #[inline]
    #[must_use]
    pub fn with_message_format(mut self, format: MessageFormat) -> Self {
        self.message_format = format;
        self
    }

    /// Select wait for the given mode.
    #[inline]
    #[must_use]
    pub fn select_timeout(&self, debug: bool) -> Duration {
        if debug {
            self.debug_select_timeout
        } else {
            self.select_timeout
        }
    }

    /// Session inactivity timeout for the given mode.
    #[inline]
    #[must_use]
    pub fn session_timeout(&self, debug: bool) -> Duration {
        if debug {
            self.debug_session_timeout
        } else {
            self.session_timeout
        }
    }

    /// Normalized root prefix, `/` or `/<root>/`.
    #[must_use]
    pub fn root_prefix(&self) -> String {
        let root = self.root_uri.trim_matches('/');
        if root.is_empty() {
            "/".to_owned()
        } else {
            format!("/{root}/")
        }
    }

    /// Period of the select clock, fixed when a session is created.
    #[inline]
    #[must_use]
    pub fn select_tick_period(&self) -> Duration {
        (self.select_timeout + TICK_SLACK) / 4
    }

    /// Period of the inactivity clock, fixed when a session is created.
    #[inline]
    #[must_use]
    pub fn inactivity_tick_period(&self) -> Duration {
        self.session_timeout + TICK_SLACK
    }

    /// Time a fresh connection gets to send its first request.
    #[inline]
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        self.session_timeout
    }
}

// ============================================================================
// Tests
// ============================================================================
