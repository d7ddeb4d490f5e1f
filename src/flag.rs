//! Flag definitions as delivered by the flag service, and the per-call targeting context.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Flag definitions keyed by slug.
pub type FlagMap = HashMap<String, FlagEntry>;

/// One flag's rollout state as seen by this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagEntry {
    /// Unique flag identifier.
    pub slug: String,
    /// Whether the flag is on for callers that no target matches.
    pub enabled: bool,
    /// Carried through from the flag service. Untargeted evaluation uses `enabled`, not this.
    #[serde(default)]
    pub default_value: bool,
    /// Per-user and per-organization overrides.
    #[serde(default)]
    pub targets: Targets,
}

impl FlagEntry {
    /// Create an untargeted flag.
    pub fn new(slug: impl Into<String>, enabled: bool) -> FlagEntry {
        FlagEntry {
            slug: slug.into(),
            enabled,
            default_value: false,
            targets: Targets::default(),
        }
    }

    /// Add a user-level override.
    pub fn with_user_target(mut self, id: impl Into<String>, enabled: bool) -> FlagEntry {
        self.targets.users.push(Target::new(id, enabled));
        self
    }

    /// Add an organization-level override.
    pub fn with_organization_target(mut self, id: impl Into<String>, enabled: bool) -> FlagEntry {
        self.targets.organizations.push(Target::new(id, enabled));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(default)]
    pub users: Vec<Target>,
    #[serde(default)]
    pub organizations: Vec<Target>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub enabled: bool,
}

impl Target {
    pub fn new(id: impl Into<String>, enabled: bool) -> Target {
        Target {
            id: id.into(),
            enabled,
        }
    }
}

/// Who a flag is being evaluated for. Both identifiers are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationContext {
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
}

impl EvaluationContext {
    pub fn new() -> EvaluationContext {
        EvaluationContext::default()
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> EvaluationContext {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_organization_id(mut self, organization_id: impl Into<String>) -> EvaluationContext {
        self.organization_id = Some(organization_id.into());
        self
    }
}

/// `TryParse` allows a single flag to fail parsing without failing the whole response.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

/// Decode a flag service response body into a [`FlagMap`].
///
/// The body must be a JSON object. Entries that don't look like a flag are dropped with a warning.
pub(crate) fn decode_flags(body: &[u8]) -> Result<FlagMap> {
    let raw: HashMap<String, TryParse<FlagEntry>> = serde_json::from_slice(body)?;

    let flags = raw
        .into_iter()
        .filter_map(|(slug, entry)| match entry {
            TryParse::Parsed(entry) => Some((slug, entry)),
            TryParse::ParseFailed(value) => {
                log::warn!(target: "runtime_flags", slug:display = slug, value:serde = value; "skipping flag definition that failed to parse");
                None
            }
        })
        .collect();

    Ok(flags)
}
