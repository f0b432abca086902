//! Bus addresses and the per-directory address allocator.
//!
//! An address is a short token of the form `<PREFIX>_<n>`, e.g. `UADDR_07`
//! or `SVR_01`. The prefix is upper-case alphanumeric and starts with a
//! letter; the suffix is a decimal counter.

use crate::error::{BusError, BusResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix used for directories that have no configured or assigned address.
pub const HUB_PREFIX: &str = "SVR";

/// Default allocator prefix for attached socket adapters.
pub const DEFAULT_PREFIX: &str = "UADDR";

/// A validated bus address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and validate an address.
    pub fn parse(s: &str) -> BusResult<Self> {
        let Some((prefix, counter)) = s.rsplit_once('_') else {
            return Err(BusError::InvalidAddress(s.to_string()));
        };
        if !is_valid_prefix(prefix)
            || counter.is_empty()
            || !counter.chars().all(|c| c.is_ascii_digit())
        {
            return Err(BusError::InvalidAddress(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The default address of a directory acting as a hub.
    pub fn hub() -> Self {
        Self(format!("{HUB_PREFIX}_01"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = BusError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Monotonic address allocator owned by one directory.
///
/// Counter values are never handed out twice, so an address is never reused
/// for the lifetime of the allocator, even after its adapter detaches.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    prefix: String,
    next: u64,
}

impl AddressAllocator {
    /// Create an allocator. Fails if the prefix is not upper-case alphanumeric.
    pub fn new(prefix: &str) -> BusResult<Self> {
        if !is_valid_prefix(prefix) {
            return Err(BusError::InvalidAddress(format!(
                "allocator prefix '{prefix}' must be upper-case alphanumeric"
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            next: 1,
        })
    }

    /// Allocate the next address, skipping any the caller reserves.
    pub fn allocate(&mut self, reserved: &Address) -> Address {
        loop {
            let n = self.next;
            self.next += 1;
            let candidate = Address(format!("{}_{n:02}", self.prefix));
            if &candidate != reserved {
                return candidate;
            }
        }
    }
}
