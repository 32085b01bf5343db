//! Request verbs understood by the pipeline.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// HTTP verb of a gateway request.
///
/// Only the mutating verbs can ever be queued; `Get` is always sent directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Post,
    Patch,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }

    /// Whether requests with this verb have side effects (and may be queued).
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Verb::Get)
    }
}

impl core::fmt::Display for Verb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Verb::Get),
            "POST" => Ok(Verb::Post),
            "PATCH" => Ok(Verb::Patch),
            "DELETE" => Ok(Verb::Delete),
            other => Err(DomainError::validation(format!(
                "unsupported verb '{other}' (expected GET, POST, PATCH or DELETE)"
            ))),
        }
    }
}
