//! Typed configuration for the link-establishment layer.
//!
//! Everything the layer reads from configuration is an explicit field
//! here; there is no ambient global lookup. An external loader
//! deserializes this from whatever source it likes and passes it into the
//! listener/connector/controller constructors.

use std::net::IpAddr;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::context::ConnectionKind;
use crate::driver::{
    ConnectOptions, DeliveryMode, Framing, ListenOptions, PayloadMode, ReceiveMode, SocketOptions,
};
use crate::name::NamingMode;

/// Backlog injected when neither the caller nor the configuration sets
/// one explicitly.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Inclusive port range scanned when the directory does not prescribe a
/// listen port.
///
/// The default `(0, 0)` means "let the transport choose any free
/// ephemeral port". The range is read once, at listen time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    /// First candidate port.
    pub low: u16,
    /// Last candidate port.
    pub high: u16,
}

impl PortRange {
    /// Whether this range delegates the choice to the transport.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.low == 0 && self.high == 0
    }
}

/// The no-delay policy, as configured.
///
/// This is deliberately lenient on the wire: unset and `true` both mean
/// enabled, `false` means disabled, and any other configured value falls
/// back to enabled rather than failing the load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NoDelayPolicy {
    /// Not configured; no-delay is enabled.
    #[default]
    Default,
    /// Explicitly enabled.
    Enabled,
    /// Explicitly disabled.
    Disabled,
}

impl NoDelayPolicy {
    /// Resolve the policy to the value applied on sockets.
    #[must_use]
    pub fn enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl Serialize for NoDelayPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(self.enabled())
    }
}

impl<'de> Deserialize<'de> for NoDelayPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Lenient;

        impl<'de> de::Visitor<'de> for Lenient {
            type Value = NoDelayPolicy;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a boolean (non-boolean values fall back to enabled)")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(if v { NoDelayPolicy::Enabled } else { NoDelayPolicy::Disabled })
            }

            // Anything that is not a boolean resolves to the safe default.
            fn visit_i64<E: de::Error>(self, _: i64) -> Result<Self::Value, E> {
                Ok(NoDelayPolicy::Default)
            }

            fn visit_u64<E: de::Error>(self, _: u64) -> Result<Self::Value, E> {
                Ok(NoDelayPolicy::Default)
            }

            fn visit_f64<E: de::Error>(self, _: f64) -> Result<Self::Value, E> {
                Ok(NoDelayPolicy::Default)
            }

            fn visit_str<E: de::Error>(self, _: &str) -> Result<Self::Value, E> {
                Ok(NoDelayPolicy::Default)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(NoDelayPolicy::Default)
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(NoDelayPolicy::Default)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                while seq.next_element::<de::IgnoredAny>()?.is_some() {}
                Ok(NoDelayPolicy::Default)
            }

            fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                while map.next_entry::<de::IgnoredAny, de::IgnoredAny>()?.is_some() {}
                Ok(NoDelayPolicy::Default)
            }
        }

        deserializer.deserialize_any(Lenient)
    }
}

/// Options applied to the task spawned for one connection.
///
/// The label ends up on the handler task's tracing span, which is how
/// link types stay distinguishable in diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    /// Label attached to the handler task's span.
    pub label: Option<String>,
}

/// Spawn options keyed by requested connection type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Options for brand-new links.
    pub new_link: SpawnOptions,
    /// Options for re-established links.
    pub reestablished: SpawnOptions,
}

/// Configuration consumed by listener, connector, and context builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Handshake deadline for one connection attempt. Started at
    /// handshake-process entry; the outbound path resets it once after
    /// name resolution.
    pub setup_timeout: Duration,
    /// Port range scanned when the directory does not prescribe a port.
    pub port_range: PortRange,
    /// Interface to bind the listener on instead of the wildcard.
    pub bind_interface: Option<IpAddr>,
    /// Extra listen options. An explicit backlog here suppresses the
    /// injected [`DEFAULT_BACKLOG`].
    pub extra_listen: ListenOptions,
    /// Extra connect options.
    pub extra_connect: ConnectOptions,
    /// Keep-alive probes on link sockets.
    pub keep_alive: bool,
    /// No-delay policy (see [`NoDelayPolicy`] for the fallback rule).
    pub no_delay: NoDelayPolicy,
    /// Enforce the same-subnet admission check on inbound peers.
    pub check_subnet: bool,
    /// Naming mode the cluster runs under.
    pub naming: NamingMode,
    /// Per-connection-type spawn options.
    pub spawn: SpawnConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(7),
            port_range: PortRange::default(),
            bind_interface: None,
            extra_listen: ListenOptions::default(),
            extra_connect: ConnectOptions::default(),
            keep_alive: true,
            no_delay: NoDelayPolicy::default(),
            check_subnet: false,
            naming: NamingMode::default(),
            spawn: SpawnConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Merge caller-supplied base listen options with this configuration.
    ///
    /// Configuration wins field-by-field over the base; the backlog rule
    /// is: explicit backlog in `extra_listen` wins, then the base's, then
    /// [`DEFAULT_BACKLOG`] is injected.
    #[must_use]
    pub fn merged_listen(&self, base: &ListenOptions) -> ListenOptions {
        ListenOptions {
            backlog: self
                .extra_listen
                .backlog
                .or(base.backlog)
                .or(Some(DEFAULT_BACKLOG)),
            bind_interface: self
                .bind_interface
                .or(self.extra_listen.bind_interface)
                .or(base.bind_interface),
            socket: base.socket.overlaid(&self.extra_listen.socket),
        }
    }

    /// Merge caller-supplied base connect options with this configuration.
    ///
    /// The configured no-delay and keep-alive values are applied here so
    /// the connect itself already carries them.
    #[must_use]
    pub fn merged_connect(&self, base: &ConnectOptions) -> ConnectOptions {
        let policy = SocketOptions {
            no_delay: Some(self.no_delay.enabled()),
            keep_alive: Some(self.keep_alive),
            ..SocketOptions::default()
        };
        ConnectOptions {
            bind_interface: self.extra_connect.bind_interface.or(base.bind_interface),
            socket: base.socket.overlaid(&self.extra_connect.socket).overlaid(&policy),
        }
    }

    /// The pre-handshake option set: receive-readiness disabled,
    /// length-prefixed framing, keep-alive and no-delay per
    /// configuration.
    #[must_use]
    pub fn pre_up_options(&self) -> SocketOptions {
        SocketOptions {
            receive: Some(ReceiveMode::Pull),
            framing: Some(Framing::LengthPrefixed),
            no_delay: Some(self.no_delay.enabled()),
            keep_alive: Some(self.keep_alive),
            ..SocketOptions::default()
        }
    }

    /// The post-handshake option set: push delivery, same framing,
    /// ordered delivery, binary payloads, no-delay.
    #[must_use]
    pub fn post_up_options(&self) -> SocketOptions {
        SocketOptions {
            receive: Some(ReceiveMode::Push),
            framing: Some(Framing::LengthPrefixed),
            delivery: Some(DeliveryMode::Ordered),
            payload: Some(PayloadMode::Binary),
            no_delay: Some(self.no_delay.enabled()),
            ..SocketOptions::default()
        }
    }

    /// Spawn options for the given connection type.
    #[must_use]
    pub fn spawn_for(&self, kind: ConnectionKind) -> &SpawnOptions {
        match kind {
            ConnectionKind::New => &self.spawn.new_link,
            ConnectionKind::Reestablished => &self.spawn.reestablished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_delay_from(json: &str) -> NoDelayPolicy {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(default)]
            no_delay: NoDelayPolicy,
        }
        serde_json::from_str::<Probe>(json).unwrap().no_delay
    }

    #[test]
    fn no_delay_unset_is_enabled() {
        assert!(no_delay_from("{}").enabled());
    }

    #[test]
    fn no_delay_true_is_enabled() {
        assert!(no_delay_from(r#"{"no_delay": true}"#).enabled());
    }

    #[test]
    fn no_delay_false_is_disabled() {
        assert!(!no_delay_from(r#"{"no_delay": false}"#).enabled());
    }

    #[test]
    fn no_delay_other_values_fall_back_to_enabled() {
        assert!(no_delay_from(r#"{"no_delay": "on"}"#).enabled());
        assert!(no_delay_from(r#"{"no_delay": 1}"#).enabled());
        assert!(no_delay_from(r#"{"no_delay": null}"#).enabled());
    }

    #[test]
    fn backlog_injected_when_unset() {
        let config = LinkConfig::default();
        let merged = config.merged_listen(&ListenOptions::default());
        assert_eq!(merged.backlog, Some(DEFAULT_BACKLOG));
    }

    #[test]
    fn explicit_backlog_suppresses_default() {
        let config = LinkConfig {
            extra_listen: ListenOptions { backlog: Some(5), ..ListenOptions::default() },
            ..LinkConfig::default()
        };
        let merged = config.merged_listen(&ListenOptions::default());
        assert_eq!(merged.backlog, Some(5));
    }

    #[test]
    fn caller_backlog_used_when_config_silent() {
        let config = LinkConfig::default();
        let base = ListenOptions { backlog: Some(64), ..ListenOptions::default() };
        assert_eq!(config.merged_listen(&base).backlog, Some(64));
    }

    #[test]
    fn pre_up_reflects_no_delay_policy() {
        let config = LinkConfig { no_delay: NoDelayPolicy::Disabled, ..LinkConfig::default() };
        assert_eq!(config.pre_up_options().no_delay, Some(false));
        assert_eq!(config.pre_up_options().receive, Some(ReceiveMode::Pull));
        assert_eq!(config.pre_up_options().framing, Some(Framing::LengthPrefixed));
    }
}
