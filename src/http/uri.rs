//! Session request URIs.
//!
//! | URI | Meaning |
//! |-----|---------|
//! | `{root}connect[/…]` | new session |
//! | `{root}select/<id>/<seq>` | long poll for server messages |
//! | `{root}xmit/<id>/<seq>` | client messages in the body |
//! | `{root}disconnect/<id>` | end the session |
//!
//! Query strings, fragments and a trailing `/` are ignored. Extra path
//! segments after the ones listed are ignored too.

use std::fmt;

use url::Url;

use crate::identifiers::SessionId;

/// Base used to resolve request targets.
const BASE: &str = "http://localhost/";

/// A parsed session URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUri {
    /// Start a session.
    Connect,
    /// Poll for messages, expecting batch `seq`.
    Select { session: SessionId, seq: u64 },
    /// Deliver client batch `seq`.
    Xmit { session: SessionId, seq: u64 },
    /// End a session.
    Disconnect { session: SessionId },
}

impl SessionUri {
    /// Parses `target` relative to `root`, which starts and ends with `/`.
    ///
    /// Returns `None` for anything that is not a session URI.
    #[must_use]
    pub fn parse(target: &str, root: &str) -> Option<Self> {
        let url = Url::parse(BASE).ok()?.join(target).ok()?;
        let path = url.path().to_ascii_lowercase();
        let rest = path.strip_prefix(root)?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let mut segments = rest.split('/');
        let verb = segments.next()?;
        let mut number = || segments.next().and_then(|s| s.parse::<u64>().ok());

        match verb {
            "connect" => Some(Self::Connect),
            "select" => Some(Self::Select {
                session: SessionId::from_u64(number()?),
                seq: number()?,
            }),
            "xmit" => Some(Self::Xmit {
                session: SessionId::from_u64(number()?),
                seq: number()?,
            }),
            "disconnect" => Some(Self::Disconnect {
                session: SessionId::from_u64(number()?),
            }),
            _ => None,
        }
    }

    /// The session named by the URI, if any.
    #[inline]
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Connect => None,
            Self::Select { session, .. }
            | Self::Xmit { session, .. }
            | Self::Disconnect { session } => Some(*session),
        }
    }
}

impl fmt::Display for SessionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::Select { session, seq } => write!(f, "select/{session}/{seq}"),
            Self::Xmit { session, seq } => write!(f, "xmit/{session}/{seq}"),
            Self::Disconnect { session } => write!(f, "disconnect/{session}"),
        }
    }
}
