//! Message names and their routing channel.
//!
//! A message name is `<channel>:<name>` or a bare `<name>`. The channel
//! decides where a directory may look for a route:
//!
//! | channel | meaning                                                      |
//! |---------|--------------------------------------------------------------|
//! | (none)  | local handlers first, then forwarding                         |
//! | `NET`   | must cross at least one hop before local handlers may answer |
//! | `IPC`   | like bare names, but only forwarded over local-pipe links    |
//! | `WS`    | like bare names, but only forwarded over web-socket links    |

use crate::error::{BusError, BusResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The routing channel of a message name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Local,
    Net,
    Ipc,
    Ws,
}

impl Channel {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "" => Some(Self::Local),
            "NET" => Some(Self::Net),
            "IPC" => Some(Self::Ipc),
            "WS" => Some(Self::Ws),
            _ => None,
        }
    }

    /// Whether local handlers may satisfy a packet that has crossed `hops` hops.
    pub fn allows_local(&self, hops: usize) -> bool {
        !matches!(self, Self::Net) || hops > 0
    }
}

/// A validated message name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageName(String);

impl MessageName {
    /// Parse a message name, validating both channel and name parts.
    pub fn parse(raw: &str) -> BusResult<Self> {
        let (tag, name) = raw.split_once(':').unwrap_or(("", raw));
        if Channel::from_tag(tag).is_none() {
            return Err(BusError::InvalidMessageName(format!(
                "'{raw}': unknown channel '{tag}'"
            )));
        }
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {
                chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            }
            _ => false,
        };
        if !valid {
            return Err(BusError::InvalidMessageName(format!(
                "'{raw}': name must start with a letter and contain only [A-Za-z0-9_.-]"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn channel(&self) -> Channel {
        self.0
            .split_once(':')
            .and_then(|(tag, _)| Channel::from_tag(tag))
            .unwrap_or(Channel::Local)
    }

    /// The name without its channel prefix.
    pub fn name(&self) -> &str {
        self.0.split_once(':').map(|(_, n)| n).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MessageName {
    type Error = BusError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<MessageName> for String {
    fn from(name: MessageName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_and_prefixed_names() {
        let foo = MessageName::parse("FOO").unwrap();
        assert_eq!(foo.channel(), Channel::Local);
        assert_eq!(foo.name(), "FOO");

        let net = MessageName::parse("NET:SRV_REFLECT").unwrap();
        assert_eq!(net.channel(), Channel::Net);
        assert_eq!(net.name(), "SRV_REFLECT");

        assert_eq!(MessageName::parse(":HELLO").unwrap().channel(), Channel::Local);
        assert_eq!(MessageName::parse("WS:chat.post").unwrap().channel(), Channel::Ws);
    }

    #[test]
    fn test_malformed_names_rejected() {
        for bad in ["", "NET:", "FOO:BAR", "1ABC", "NET:has space", "net:LOWER_TAG", "A:B:C"] {
            assert!(
                matches!(MessageName::parse(bad), Err(BusError::InvalidMessageName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_net_channel_requires_a_hop() {
        assert!(!Channel::Net.allows_local(0));
        assert!(Channel::Net.allows_local(1));
        assert!(Channel::Local.allows_local(0));
        assert!(Channel::Ipc.allows_local(0));
    }
}
