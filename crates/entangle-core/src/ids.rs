//! Identifier newtypes and the call correlation id generator.
//!
//! [`ServiceId`] and [`SessionId`] are plain branded strings. [`CallId`]
//! pairs a `Call`/`Read` request with its eventual response: 8 bytes made of
//! a big-endian Unix-second timestamp followed by 4 random bytes, encoded as
//! unpadded base64url (11 characters).
//!
//! Uniqueness inside one second is enforced by [`CallIdGenerator`], which
//! remembers the random halves issued during the current second and redraws
//! on collision. The remembered set is dropped as soon as the clock moves to
//! the next second, so memory stays bounded without a cleanup task. This is
//! best-effort, process-wide uniqueness for correlation, not a security token.

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Name under which an object is registered on the server and
    /// subscribed to by clients.
    ServiceId
}

branded_id! {
    /// Server-side identifier of one accepted connection.
    SessionId
}

branded_id! {
    /// Correlation token pairing a request with its response.
    CallId
}

impl SessionId {
    /// Create a new session ID (UUID v7, time-ordered).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("sess_{}", Uuid::now_v7()))
    }
}

impl CallId {
    /// Generate a new id from the process-wide generator.
    #[must_use]
    pub fn generate() -> Self {
        CallIdGenerator::global().next()
    }

    /// Unix second encoded in the first four bytes, if the id is well formed.
    #[must_use]
    pub fn timestamp_secs(&self) -> Option<u32> {
        let bytes = URL_SAFE_NO_PAD.decode(self.0.as_bytes()).ok()?;
        let head: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(head))
    }
}

/// Random halves issued during one wall-clock second.
struct IssuedWindow {
    second: u32,
    randoms: HashSet<u32>,
}

type RandomSource = Box<dyn FnMut() -> u32 + Send>;

/// Process-wide call id generator.
///
/// Construct once at startup (or use [`CallIdGenerator::global`]); entries
/// for a finished second are discarded on the first draw in a later second.
pub struct CallIdGenerator {
    window: Mutex<IssuedWindow>,
    random: Mutex<RandomSource>,
}

impl CallIdGenerator {
    /// Create a generator backed by the thread-local RNG.
    pub fn new() -> Self {
        Self::with_random_source(Box::new(rand::random::<u32>))
    }

    fn with_random_source(random: RandomSource) -> Self {
        Self {
            window: Mutex::new(IssuedWindow {
                second: 0,
                randoms: HashSet::new(),
            }),
            random: Mutex::new(random),
        }
    }

    /// The shared generator used by [`CallId::generate`].
    pub fn global() -> &'static CallIdGenerator {
        static GLOBAL: OnceLock<CallIdGenerator> = OnceLock::new();
        GLOBAL.get_or_init(CallIdGenerator::new)
    }

    /// Issue a new id stamped with the current second.
    pub fn next(&self) -> CallId {
        self.next_at(unix_seconds())
    }

    fn next_at(&self, second: u32) -> CallId {
        let mut window = self.window.lock();
        if window.second != second {
            window.second = second;
            window.randoms.clear();
        }
        let mut random = self.random.lock();
        let rand = loop {
            let candidate = (random)();
            if window.randoms.insert(candidate) {
                break candidate;
            }
        };
        drop(random);
        drop(window);

        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&second.to_be_bytes());
        bytes[4..].copy_from_slice(&rand.to_be_bytes());
        CallId(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Number of random halves remembered for the current second.
    pub fn issued_this_second(&self) -> usize {
        self.window.lock().randoms.len()
    }
}

impl Default for CallIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_seconds() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    u32::try_from(secs).unwrap_or(u32::MAX)
}
