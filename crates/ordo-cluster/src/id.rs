//! Monotonic two-part identifiers
//!
//! A [`ComplexId`] is a coarse, externally supplied `prefix` (the UTC minute
//! by default) plus a generator-local `counter`. Its string form appends a
//! length-prefixed base-36 counter to the prefix, so plain string comparison
//! of encoded ids agrees with the numeric order of the ids:
//!
//! ```text
//!   prefix        counter 4711 -> "3" (digit count) + "3mv" (base-36 digits)
//!   202410191530  33mv
//! ```
//!
//! [`MonotonicIdGenerator`] issues ids and reconciles against ids observed
//! from peers without ever moving backwards.

use crate::error::{ClusterError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Width of prefixes produced by [`MinuteClock`] (`%Y%m%d%H%M`)
pub const MINUTE_PREFIX_WIDTH: usize = 12;

/// Two-part identifier ordered by prefix, then counter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComplexId {
    pub prefix: String,
    pub counter: u64,
}

impl ComplexId {
    pub fn new(prefix: impl Into<String>, counter: u64) -> Self {
        Self {
            prefix: prefix.into(),
            counter,
        }
    }

    /// String form: `prefix` followed by the length-prefixed base-36 counter
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.prefix.len() + 14);
        out.push_str(&self.prefix);
        encode_counter_into(self.counter, &mut out);
        out
    }

    /// Decode an id whose prefix is `prefix_width` bytes wide.
    ///
    /// Trailing characters after the counter are rejected; use
    /// [`ComplexId::decode_prefix`] to split a longer key.
    pub fn decode(encoded: &str, prefix_width: usize) -> Result<Self> {
        let (id, rest) = Self::decode_prefix(encoded, prefix_width)?;
        if !rest.is_empty() {
            return Err(invalid(encoded, "trailing characters"));
        }
        Ok(id)
    }

    /// Decode the leading id of `encoded` and return the unparsed remainder
    pub fn decode_prefix(encoded: &str, prefix_width: usize) -> Result<(Self, &str)> {
        if !encoded.is_char_boundary(prefix_width) || encoded.len() < prefix_width {
            return Err(invalid(encoded, "shorter than prefix"));
        }
        let (prefix, tail) = encoded.split_at(prefix_width);
        let (counter, rest) = decode_counter(tail).map_err(|reason| invalid(encoded, reason))?;
        Ok((Self::new(prefix, counter), rest))
    }
}

impl PartialOrd for ComplexId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComplexId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prefix
            .cmp(&other.prefix)
            .then(self.counter.cmp(&other.counter))
    }
}

impl fmt::Display for ComplexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn invalid(id: &str, reason: &'static str) -> ClusterError {
    ClusterError::InvalidId {
        id: id.to_string(),
        reason,
    }
}

/// Length-prefixed base-36 encoding of a counter
pub fn encode_counter(value: u64) -> String {
    let mut out = String::with_capacity(14);
    encode_counter_into(value, &mut out);
    out
}

fn encode_counter_into(mut value: u64, out: &mut String) {
    let mut digits = [0u8; 13];
    let mut len = 0;
    loop {
        digits[len] = DIGITS[(value % 36) as usize];
        len += 1;
        value /= 36;
        if value == 0 {
            break;
        }
    }
    out.push(DIGITS[len] as char);
    for &d in digits[..len].iter().rev() {
        out.push(d as char);
    }
}

/// Decode a length-prefixed base-36 counter, returning the remainder
pub fn decode_counter(input: &str) -> std::result::Result<(u64, &str), &'static str> {
    let bytes = input.as_bytes();
    let len = match bytes.first() {
        Some(&b) => digit_value(b).ok_or("bad length digit")? as usize,
        None => return Err("missing counter"),
    };
    if len == 0 {
        return Err("zero-length counter");
    }
    if bytes.len() < 1 + len {
        return Err("truncated counter");
    }
    let mut value: u64 = 0;
    for &b in &bytes[1..=len] {
        let d = digit_value(b).ok_or("bad counter digit")?;
        value = value
            .checked_mul(36)
            .and_then(|v| v.checked_add(d))
            .ok_or("counter overflow")?;
    }
    if len > 1 && bytes[1] == b'0' {
        return Err("non-canonical counter");
    }
    Ok((value, &input[1 + len..]))
}

fn digit_value(b: u8) -> Option<u64> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as u64),
        b'a'..=b'z' => Some((b - b'a') as u64 + 10),
        _ => None,
    }
}

/// Source of the coarse, externally ordered id prefix
pub trait PrefixSource: Send + Sync {
    fn current_prefix(&self) -> String;
}

/// UTC wall clock truncated to minutes (`%Y%m%d%H%M`)
#[derive(Debug, Clone, Copy, Default)]
pub struct MinuteClock;

impl PrefixSource for MinuteClock {
    fn current_prefix(&self) -> String {
        Utc::now().format("%Y%m%d%H%M").to_string()
    }
}

/// Constant prefix, for tests and replay
#[derive(Debug, Clone)]
pub struct FixedPrefix(pub String);

impl PrefixSource for FixedPrefix {
    fn current_prefix(&self) -> String {
        self.0.clone()
    }
}

/// Locally unique, globally comparable id generator.
///
/// Not synchronised: the owning node serialises access.
#[derive(Debug, Clone)]
pub struct MonotonicIdGenerator {
    prefix: String,
    counter: u64,
}

impl MonotonicIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: 0,
        }
    }

    /// Create a generator positioned at the source's current prefix
    pub fn from_source(source: &dyn PrefixSource) -> Self {
        Self::new(source.current_prefix())
    }

    /// Merge an observed id into the generator state. Returns whether the
    /// state changed; never moves backwards.
    pub fn reconcile(&mut self, prefix: &str, counter: Option<u64>) -> bool {
        match prefix.cmp(self.prefix.as_str()) {
            Ordering::Greater => {
                self.prefix = prefix.to_string();
                self.counter = counter.unwrap_or(0);
                true
            }
            Ordering::Equal => match counter {
                Some(c) if c > self.counter => {
                    self.counter = c;
                    true
                }
                _ => false,
            },
            Ordering::Less => false,
        }
    }

    /// Reconcile against an already decoded id
    pub fn reconcile_id(&mut self, id: &ComplexId) -> bool {
        self.reconcile(&id.prefix, Some(id.counter))
    }

    /// Track wall-clock advance while idle
    pub fn refresh_prefix(&mut self, source: &dyn PrefixSource) -> bool {
        self.reconcile(&source.current_prefix(), None)
    }

    pub fn next(&mut self, step: u64) -> ComplexId {
        self.counter += step;
        ComplexId::new(self.prefix.clone(), self.counter)
    }

    pub fn next_encoded(&mut self, step: u64) -> String {
        self.next(step).encode()
    }

    /// Smallest counter above the current one that falls in `lane` of `lanes`.
    ///
    /// Generators on different lanes can never issue the same id, however
    /// their reconciliation interleaves.
    pub fn next_in_lane(&mut self, lane: u32, lanes: u32) -> ComplexId {
        let lanes = lanes.max(1) as u64;
        let lane = lane as u64 % lanes;
        let base = self.counter + 1;
        let offset = (lane + lanes - base % lanes) % lanes;
        self.counter = base + offset;
        ComplexId::new(self.prefix.clone(), self.counter)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn current(&self) -> ComplexId {
        ComplexId::new(self.prefix.clone(), self.counter)
    }
}
