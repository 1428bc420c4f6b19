//! Resource class names and request quantities.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix shared by every hugepage resource class.
pub const HUGEPAGES_PREFIX: &str = "hugepages-";

const MEMORY: &str = "memory";
const CPU: &str = "cpu";

/// Opaque resource class identifier.
///
/// Two families matter to the admission core: the regular memory class and
/// the hugepage classes keyed by page size (`hugepages-2Mi`,
/// `hugepages-1Gi`, ...). Everything else passes through untouched.
/// Equality is byte-exact and the ordering is lexicographic, so maps keyed
/// by `ResourceName` iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    /// Wrap an arbitrary resource class name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        ResourceName(name.into())
    }

    /// The regular memory class.
    pub fn memory() -> Self {
        ResourceName(MEMORY.to_string())
    }

    /// The cpu class (never placed by this core, but part of QoS math).
    pub fn cpu() -> Self {
        ResourceName(CPU.to_string())
    }

    /// The hugepage class for the given page size in bytes,
    /// e.g. `hugepages-1Gi` for `1 << 30`.
    pub fn hugepages(page_size: u64) -> Self {
        ResourceName(format!("{}{}", HUGEPAGES_PREFIX, format_binary_si(page_size)))
    }

    /// Whether this is the regular memory class.
    pub fn is_memory(&self) -> bool {
        self.0 == MEMORY
    }

    /// Whether this is one of the hugepage classes.
    pub fn is_hugepages(&self) -> bool {
        self.0.starts_with(HUGEPAGES_PREFIX)
    }

    /// Whether the admission core places this class at all.
    pub fn is_memory_class(&self) -> bool {
        self.is_memory() || self.is_hugepages()
    }

    /// The raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(name: &str) -> Self {
        ResourceName::new(name)
    }
}

/// A requested amount of a resource, as written in a pod spec.
///
/// Holds the textual form (`"1Gi"`, `"1500M"`, `"1073741824"`); conversion
/// to bytes happens on demand and fails for values that are not a whole
/// number of bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(String);

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

impl Quantity {
    /// Wrap a textual quantity without validating it.
    pub fn new<S: Into<String>>(value: S) -> Self {
        Quantity(value.into())
    }

    /// A quantity for an exact byte count, formatted binary-SI.
    pub fn from_bytes(bytes: u64) -> Self {
        Quantity(format_binary_si(bytes))
    }

    /// The textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to a byte count.
    ///
    /// Accepts a decimal mantissa with an optional fraction and an optional
    /// SI suffix (`k`/`M`/`G`/`T`/`P`/`E` decimal, `Ki`..`Ei` binary).
    /// Fails with [`Error::InvalidQuantity`] when the result is not a whole
    /// number of bytes or does not fit in a `u64`.
    pub fn to_bytes(&self) -> Result<u64> {
        let invalid = || Error::InvalidQuantity(self.0.clone());
        let text = self.0.trim();

        let split = text
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(text.len());
        let (mantissa, suffix) = text.split_at(split);
        if mantissa.is_empty() {
            return Err(invalid());
        }

        let multiplier = match suffix {
            "" => 1u64,
            _ => DECIMAL_SUFFIXES
                .iter()
                .chain(BINARY_SUFFIXES.iter())
                .find(|(s, _)| *s == suffix)
                .map(|&(_, m)| m)
                .ok_or_else(invalid)?,
        };

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }

        let int_value: u128 = match int_part {
            "" => 0,
            _ => int_part.parse().map_err(|_| invalid())?,
        };
        let mut total = int_value.checked_mul(multiplier as u128).ok_or_else(invalid)?;

        if !frac_part.is_empty() {
            let frac_value: u128 = frac_part.parse().map_err(|_| invalid())?;
            let scale = 10u128
                .checked_pow(frac_part.len() as u32)
                .ok_or_else(invalid)?;
            let frac_bytes = frac_value.checked_mul(multiplier as u128).ok_or_else(invalid)?;
            if frac_bytes % scale != 0 {
                return Err(invalid());
            }
            total = total.checked_add(frac_bytes / scale).ok_or_else(invalid)?;
        }

        u64::try_from(total).map_err(|_| invalid())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Quantity::new(value)
    }
}

/// Format a byte count with the largest binary suffix that divides it.
fn format_binary_si(bytes: u64) -> String {
    for &(suffix, multiplier) in BINARY_SUFFIXES.iter().rev() {
        if bytes >= multiplier && bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, suffix);
        }
    }
    bytes.to_string()
}
