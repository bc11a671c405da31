use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("'{0}' is not a valid record id")]
pub struct InvalidEid(String);

/// Identifier of an embedding record: a lowercase ULID.
///
/// Sorts by creation time, so the records of one run list in the order they
/// were written under their month prefix. Ids read back from stored records
/// are validated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Eid(String);

impl Eid {
    pub fn new() -> Eid {
        Eid(rusty_ulid::generate_ulid_string().to_lowercase())
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Eid {
    type Err = InvalidEid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        rusty_ulid::Ulid::from_str(&s.to_ascii_uppercase())
            .map(|_| Eid(s.to_ascii_lowercase()))
            .map_err(|_| InvalidEid(s.to_string()))
    }
}

impl TryFrom<String> for Eid {
    type Error = InvalidEid;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Eid> for String {
    fn from(id: Eid) -> Self {
        id.0
    }
}
