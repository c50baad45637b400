//! Node naming.
//!
//! Every cluster member is identified by a name of the form `alive@host`:
//! a short identifier (the "alive" part) and a host part, separated by
//! exactly one `@`. What counts as a valid host part depends on the naming
//! mode the cluster runs under:
//!
//! - **Short**: the host part is a single DNS label (`node1@alpha`)
//! - **Long**: the host part is a fully-qualified hostname or a literal IP
//!   address (`node1@alpha.cluster.local`, `node1@10.0.0.5`)
//!
//! A malformed name is a fatal, non-recoverable condition: nothing in this
//! layer retries naming errors, and no socket is ever opened for a name
//! that fails to parse.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Naming mode the cluster runs under.
///
/// The mode is read from configuration once and applied uniformly: a node
/// using short names cannot address a long-named peer and vice versa.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingMode {
    /// Host part must be a single label without dots.
    #[default]
    Short,
    /// Host part must be a fully-qualified hostname or an IP literal.
    Long,
}

/// Errors produced by node-name parsing.
///
/// All variants are fatal for the operation that supplied the name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The name contains no `@` separator.
    #[error("node name {name:?} has no '@' separator")]
    MissingSeparator {
        /// The offending input.
        name: String,
    },

    /// The name contains more than one `@` separator.
    #[error("node name {name:?} has more than one '@' separator")]
    ExtraSeparator {
        /// The offending input.
        name: String,
    },

    /// The part before `@` is empty or contains invalid characters.
    #[error("node name {name:?} has an invalid identifier part")]
    InvalidAlive {
        /// The offending input.
        name: String,
    },

    /// Short naming mode requires a single-label host part.
    #[error("host part {host:?} of {name:?} is not a single label (short naming mode)")]
    MultiLabelHost {
        /// The offending input.
        name: String,
        /// The host part that failed the check.
        host: String,
    },

    /// Long naming mode requires a parseable, fully-qualified host part.
    #[error("host part {host:?} of {name:?} is not a parseable address (long naming mode)")]
    UnparseableHost {
        /// The offending input.
        name: String,
        /// The host part that failed the check.
        host: String,
    },
}

/// A validated cluster node name.
///
/// Construction goes through [`NodeName::parse`]; once built, the name is
/// immutable and its parts are always consistent with the mode it was
/// parsed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeName {
    full: String,
    at: usize,
}

impl NodeName {
    /// Parse `input` under the given naming mode.
    ///
    /// # Errors
    ///
    /// Returns a [`NameError`] when the separator count, identifier part,
    /// or host part violates the mode's invariants. Parsing never panics,
    /// for any input.
    pub fn parse(input: &str, mode: NamingMode) -> Result<Self, NameError> {
        let mut separators = input.char_indices().filter(|(_, c)| *c == '@');
        let at = match separators.next() {
            Some((at, _)) => at,
            None => return Err(NameError::MissingSeparator { name: input.to_string() }),
        };
        if separators.next().is_some() {
            return Err(NameError::ExtraSeparator { name: input.to_string() });
        }

        let (alive, host) = (&input[..at], &input[at + 1..]);
        if alive.is_empty() || !alive.chars().all(is_alive_char) {
            return Err(NameError::InvalidAlive { name: input.to_string() });
        }

        match mode {
            NamingMode::Short => {
                if host.is_empty() || !is_label(host) {
                    return Err(NameError::MultiLabelHost {
                        name: input.to_string(),
                        host: host.to_string(),
                    });
                }
            },
            NamingMode::Long => {
                if host.parse::<IpAddr>().is_err() && !is_qualified_hostname(host) {
                    return Err(NameError::UnparseableHost {
                        name: input.to_string(),
                        host: host.to_string(),
                    });
                }
            },
        }

        Ok(Self { full: input.to_string(), at })
    }

    /// The short identifier before the `@`.
    #[must_use]
    pub fn alive(&self) -> &str {
        &self.full[..self.at]
    }

    /// The host part after the `@`.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.full[self.at + 1..]
    }

    /// The full `alive@host` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

fn is_alive_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn is_label(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_qualified_hostname(s: &str) -> bool {
    // A qualified hostname has at least two labels.
    s.contains('.') && s.split('.').all(is_label)
}
