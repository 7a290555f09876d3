//! Public-key-derived identifiers.
//!
//! Task, subtask and node identities are all the same shape: a 32-byte
//! digest of some public key material, hex-encoded for display and
//! serialization. Collisions are assumed impossible (spec Open Question 4).

use std::fmt;
use std::str::FromStr;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; 32]);

impl Id {
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(digest.into())
    }

    /// Derives a fresh, still publicly-attributable id by mixing a
    /// disambiguator (e.g. a counter or timestamp) into the public key
    /// material, so a single requestor can mint many distinct task ids.
    pub fn derive(public_key: &[u8], disambiguator: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        hasher.update(disambiguator);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(self.0))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_str(&s).map_err(D::Error::custom)
    }
}

/// Opaque string identifier for a subtask, scoped to its parent task.
/// Subtask ids are minted by the App Client, not derived from a public key.
pub type SubtaskId = String;

/// Names an execution environment registered with the Environment Manager.
pub type EnvId = String;

/// Names the App Client backing a particular application.
pub type AppId = String;
