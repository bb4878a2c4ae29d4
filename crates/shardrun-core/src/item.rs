//! Work items and their payload schema.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CoreError, ItemId, ItemStatus};

/// Payload of a work item, validated once at ingestion.
///
/// Known fields are typed; everything else the listing produced is kept
/// verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Clone locator of the repository.
    #[serde(rename = "URL", alias = "url", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Repository name.
    #[serde(rename = "Name", alias = "name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Owning organisation or user.
    #[serde(alias = "Org", default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,

    /// Opaque fields carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Payload {
    /// Create a payload with just a URL.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Builder method to set the repository name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder method to set the organisation.
    pub fn with_org(mut self, org: impl Into<String>) -> Self {
        self.org = Some(org.into());
        self
    }

    /// Extract the clone target, or `None` if the required locator fields
    /// are absent or unusable.
    pub fn locator(&self) -> Option<Locator> {
        let url = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;

        let name = match self.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => name_from_url(url)?,
        };

        if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
            return None;
        }

        Some(Locator {
            url: url.to_string(),
            name,
            org: self.org.clone(),
        })
    }
}

/// Derive a repository name from the last path segment of a clone URL.
fn name_from_url(url: &str) -> Option<String> {
    let segment = url.trim_end_matches('/').rsplit(|c: char| c == '/' || c == ':').next()?;
    let name = segment.strip_suffix(".git").unwrap_or(segment);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Validated clone target extracted from a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub url: String,
    pub name: String,
    pub org: Option<String>,
}

impl Locator {
    /// `org/name` when the organisation is known, else `name`.
    pub fn display_name(&self) -> String {
        match &self.org {
            Some(org) => format!("{}/{}", org, self.name),
            None => self.name.clone(),
        }
    }
}

/// Reference to the packaged artifact of a successful item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Where the archive was written.
    pub location: String,

    /// Revision that was fetched (short commit hash), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Organisation the item was fetched under, after defaulting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
}

/// One unit of work with an immutable payload and a tracked terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier, unique within a run.
    pub id: ItemId,

    /// Position in the original listing.
    pub position: usize,

    /// Payload as ingested.
    pub payload: Payload,

    status: ItemStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact: Option<ArtifactRef>,
}

impl WorkItem {
    /// Create a pending item whose id is derived from its position.
    pub fn new(position: usize, payload: Payload) -> Self {
        Self {
            id: ItemId::from_position(position),
            position,
            payload,
            status: ItemStatus::Pending,
            error: None,
            artifact: None,
        }
    }

    /// Builder method to set a specific ID.
    pub fn with_id(mut self, id: ItemId) -> Self {
        self.id = id;
        self
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.artifact.as_ref()
    }

    /// Mark the item as successfully archived.
    pub fn mark_success(&mut self, artifact: ArtifactRef) -> Result<(), CoreError> {
        self.transition(ItemStatus::Success)?;
        self.artifact = Some(artifact);
        Ok(())
    }

    /// Mark the item as transiently failed.
    pub fn mark_retryable(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.transition(ItemStatus::Retryable)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Mark the item as permanently failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.transition(ItemStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    fn transition(&mut self, to: ItemStatus) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                item: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Build work items from raw listing descriptors.
///
/// A descriptor is either `{"id": ..., "payload": {...}}` or a bare payload
/// object. Ids default to the descriptor's position.
pub fn ingest(descriptors: Vec<Value>) -> Result<Vec<WorkItem>, CoreError> {
    let mut items = Vec::with_capacity(descriptors.len());
    let mut seen = HashSet::with_capacity(descriptors.len());

    for (position, descriptor) in descriptors.into_iter().enumerate() {
        let Value::Object(mut object) = descriptor else {
            return Err(CoreError::Validation(format!(
                "descriptor at position {} is not an object",
                position
            )));
        };

        let (id, payload_value) = if object.contains_key("payload") {
            let id = match object.remove("id") {
                None | Some(Value::Null) => ItemId::from_position(position),
                Some(Value::String(s)) if ItemId::new(s.as_str()).is_path_safe() => ItemId::new(s),
                Some(other) => {
                    return Err(CoreError::Validation(format!(
                        "descriptor at position {} has invalid id: {}",
                        position, other
                    )))
                }
            };
            let payload = object.remove("payload").unwrap_or(Value::Null);
            (id, payload)
        } else {
            (ItemId::from_position(position), Value::Object(object))
        };

        if !payload_value.is_object() {
            return Err(CoreError::Validation(format!(
                "item {} has a missing or non-object payload",
                id
            )));
        }

        let payload: Payload = serde_json::from_value(payload_value).map_err(|e| {
            CoreError::Validation(format!("item {} has a malformed payload: {}", id, e))
        })?;

        if !seen.insert(id.clone()) {
            return Err(CoreError::Validation(format!("duplicate item id: {}", id)));
        }

        items.push(WorkItem::new(position, payload).with_id(id));
    }

    Ok(items)
}
