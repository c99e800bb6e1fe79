//! # Wire and domain types
//!
//! Types exchanged between the manager, the workers and HTTP clients.
//!
//! - [`Task`] - a unit of work dispatched to workers (one per partition).
//! - [`WorkerResponse`] - the words a worker found in its partition.
//! - [`CrackRequest`], [`CrackResponse`], [`StatusResponse`] - client-facing
//!   HTTP bodies.
//!
//! Broker and internal HTTP payloads are JSON with PascalCase field names
//! (`RequestId`, `PartNumber`, `Alphabet.Symbols`, `Answers.Words`, ...).
//! Client-facing bodies use camelCase.

use crate::{Error, Result};
use core::{fmt, str::FromStr};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashSet;
use uuid::Uuid;

/// Symbols searched by default: lowercase latin letters followed by digits.
pub const DEFAULT_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

/// Length in hex digits of an MD5 digest.
pub const DIGEST_HEX_LEN: usize = 32;

/// Identifier of an accepted crack request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidRequest {
                reason: format!("invalid request id `{s}`: {e}"),
            })
    }
}

/// Lifecycle status of a request.
///
/// `InProgress` is initial; `Ready` and `Error` are terminal and never change
/// again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    #[default]
    InProgress,
    Ready,
    Error,
}

impl RequestStatus {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Returns the status after attempting a transition to `next`.
    ///
    /// Terminal statuses absorb every transition, so concurrent writers can
    /// never move a request backwards.
    #[must_use]
    pub const fn advance(self, next: Self) -> Self {
        if self.is_terminal() { self } else { next }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Ready => "READY",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks that `hash` is an MD5 hex digest and returns it lowercased.
pub fn normalize_digest(hash: &str) -> Result<String> {
    let hash = hash.trim();
    if hash.len() != DIGEST_HEX_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidRequest {
            reason: format!("hash must be {DIGEST_HEX_LEN} hex digits, got `{hash}`"),
        });
    }
    Ok(hash.to_ascii_lowercase())
}

/// Ordered set of symbols. Position defines the digit value in the
/// numeral system used to enumerate candidates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alphabet {
    #[serde(rename = "Symbols")]
    pub symbols: Vec<String>,
}

impl Alphabet {
    pub fn from_chars(chars: &str) -> Self {
        Self {
            symbols: chars.chars().map(String::from).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(Error::Malformed {
                reason: "alphabet is empty".into(),
            });
        }
        let mut seen = HashSet::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            if symbol.chars().count() != 1 {
                return Err(Error::Malformed {
                    reason: format!("alphabet symbol `{symbol}` is not a single character"),
                });
            }
            if !seen.insert(symbol.as_str()) {
                return Err(Error::Malformed {
                    reason: format!("alphabet symbol `{symbol}` is duplicated"),
                });
            }
        }
        Ok(())
    }
}

impl Default for Alphabet {
    fn default() -> Self {
        Self::from_chars(DEFAULT_ALPHABET)
    }
}

/// Encoding shared by every payload carried over the broker or internal HTTP.
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Semantic checks applied after decoding.
    fn validate(&self) -> Result<()>;

    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Malformed {
            reason: format!("failed to encode payload: {e}"),
        })
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let message: Self = serde_json::from_slice(payload).map_err(|e| Error::Malformed {
            reason: e.to_string(),
        })?;
        message.validate()?;
        Ok(message)
    }
}

/// A unit of brute-force work: one partition of a request's keyspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    pub request_id: RequestId,
    pub part_number: u32,
    pub part_count: u32,
    pub hash: String,
    pub max_length: u32,
    pub alphabet: Alphabet,
}

impl Task {
    /// Builds every partition of a request over the default alphabet.
    pub fn fan_out(request_id: RequestId, hash: &str, max_length: u32, part_count: u32) -> Vec<Self> {
        (0..part_count)
            .map(|part_number| Self {
                request_id,
                part_number,
                part_count,
                hash: hash.to_owned(),
                max_length,
                alphabet: Alphabet::default(),
            })
            .collect()
    }
}

impl WireMessage for Task {
    fn validate(&self) -> Result<()> {
        if self.part_count == 0 || self.part_number >= self.part_count {
            return Err(Error::Malformed {
                reason: format!(
                    "part {} is outside of [0, {})",
                    self.part_number, self.part_count
                ),
            });
        }
        if self.max_length == 0 {
            return Err(Error::Malformed {
                reason: "max length must be positive".into(),
            });
        }
        normalize_digest(&self.hash).map_err(|e| Error::Malformed {
            reason: e.to_string(),
        })?;
        self.alphabet.validate()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answers {
    #[serde(rename = "Words", default)]
    pub words: Vec<String>,
}

/// Matches a worker found in one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerResponse {
    pub request_id: RequestId,
    pub part_number: u32,
    #[serde(default)]
    pub answers: Answers,
}

impl WorkerResponse {
    pub fn for_task(task: &Task, words: Vec<String>) -> Self {
        Self {
            request_id: task.request_id,
            part_number: task.part_number,
            answers: Answers { words },
        }
    }

    pub fn words(&self) -> &[String] {
        &self.answers.words
    }
}

impl WireMessage for WorkerResponse {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// `POST /api/hash/crack` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrackRequest {
    pub hash: String,
    pub max_length: u32,
}

/// `POST /api/hash/crack` reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrackResponse {
    pub request_id: RequestId,
}

/// `GET /api/hash/status` reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<String>,
    pub progress: u8,
}
