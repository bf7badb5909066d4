//! Core types for the metal provider

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{Error, Operation, Result};

/// Maximum hostname length (RFC 1123 label)
const MAX_HOSTNAME_LEN: usize = 63;

/// Lifecycle state of a single machine instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    Absent,
    Creating,
    AwaitingReady,
    Active,
    Deleting,
    Failed,
}

impl LifecycleState {
    /// `Absent` and `Failed` end an attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Absent | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Absent => write!(f, "Absent"),
            LifecycleState::Creating => write!(f, "Creating"),
            LifecycleState::AwaitingReady => write!(f, "AwaitingReady"),
            LifecycleState::Active => write!(f, "Active"),
            LifecycleState::Deleting => write!(f, "Deleting"),
            LifecycleState::Failed => write!(f, "Failed"),
        }
    }
}

/// Stable identifier used for locking and lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Key for a machine the provider already assigned an id to
    pub fn from_id(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for keys derived from a spec that has not been created yet
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with("pending-")
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(id: &str) -> Self {
        Self::from_id(id)
    }
}

/// Declared desired attributes of a machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub hostname: String,
    /// Display name, defaults to the hostname
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub image: String,
    pub partition: String,
    pub size: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Bootstrap payload handed to the machine on first boot
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub ssh_public_keys: Vec<String>,
}

impl ResourceSpec {
    pub fn new(
        hostname: impl Into<String>,
        image: impl Into<String>,
        partition: impl Into<String>,
        size: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            image: image.into(),
            partition: partition.into(),
            size: size.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_user_data(mut self, user_data: impl Into<String>) -> Self {
        self.user_data = Some(user_data.into());
        self
    }

    pub fn with_ssh_public_keys(mut self, keys: Vec<String>) -> Self {
        self.ssh_public_keys = keys;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.hostname)
    }

    /// Check required fields before anything is sent to the provider
    pub fn validate(&self) -> Result<()> {
        validate_hostname(&self.hostname)?;

        for (field, value) in [
            ("image", &self.image),
            ("partition", &self.partition),
            ("size", &self.size),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(field, "must not be empty"));
            }
        }

        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(Error::validation("name", "must not be blank when set"));
            }
        }

        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(Error::validation("tags", "tags must not be empty strings"));
        }

        if self.ssh_public_keys.iter().any(|k| k.trim().is_empty()) {
            return Err(Error::validation("ssh_public_keys", "key references must not be empty"));
        }

        Ok(())
    }

    /// Deterministic placeholder key used before the provider assigns an id
    pub fn key(&self) -> ResourceKey {
        let identity = format!(
            "{}/{}/{}/{}",
            self.project.as_deref().unwrap_or_default(),
            self.partition,
            self.image,
            self.hostname
        );
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, identity.as_bytes());
        ResourceKey(format!("pending-{}", id))
    }

    /// Force-replace fields that differ from `prior`
    ///
    /// Any change listed here needs a destroy and a fresh create.
    pub fn replacement_fields(&self, prior: &ResourceSpec) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.image != prior.image {
            fields.push("image");
        }
        if self.partition != prior.partition {
            fields.push("partition");
        }
        if self.project != prior.project {
            fields.push("project");
        }
        if self.user_data != prior.user_data {
            fields.push("user_data");
        }
        fields
    }
}

fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        return Err(Error::validation("hostname", "must not be empty"));
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(Error::validation(
            "hostname",
            format!("must be at most {} characters (got {})", MAX_HOSTNAME_LEN, hostname.len()),
        ));
    }
    if let Some((pos, c)) = hostname
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '-'))
    {
        return Err(Error::validation(
            "hostname",
            format!("invalid character '{}' at position {}", c, pos),
        ));
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return Err(Error::validation("hostname", "must not start or end with a hyphen"));
    }
    Ok(())
}

/// Network attached to an allocated machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub network_id: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub private: bool,
}

/// Allocation detail reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub hostname: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub size: String,
    pub partition: String,
    pub image: String,
    #[serde(default)]
    pub project: Option<String>,
    /// Generated console password, only present after provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_password: Option<String>,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub ssh_public_keys: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Authoritative observed state of a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: String,
    pub state: LifecycleState,
    pub allocation: Allocation,
    /// Most recent provisioning event reported by the machine
    #[serde(default)]
    pub last_event: Option<String>,
    pub created: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::from_id(&self.id)
    }

    /// Look up a watchable attribute by name
    pub fn attribute(&self, name: &str) -> Option<String> {
        let alloc = &self.allocation;
        match name {
            "state" => Some(self.state.to_string()),
            "last_event" => self.last_event.clone(),
            "hostname" => Some(alloc.hostname.clone()),
            "name" => Some(alloc.name.clone()),
            "description" => alloc.description.clone(),
            "image" => Some(alloc.image.clone()),
            "partition" => Some(alloc.partition.clone()),
            "size" => Some(alloc.size.clone()),
            _ => None,
        }
    }

    pub fn primary_network(&self) -> Result<&NetworkAttachment> {
        self.allocation
            .networks
            .first()
            .ok_or_else(|| Error::MissingNetwork {
                operation: Operation::Read,
                id: self.id.clone(),
            })
    }

    pub fn access_public_ipv4(&self) -> Option<&str> {
        first_ip(self.allocation.networks.iter().filter(|n| !n.private))
    }

    pub fn access_private_ipv4(&self) -> Option<&str> {
        first_ip(self.allocation.networks.iter().filter(|n| n.private))
    }
}

fn first_ip<'a>(mut networks: impl Iterator<Item = &'a NetworkAttachment>) -> Option<&'a str> {
    networks.find_map(|n| n.ips.first().map(String::as_str))
}

/// Target condition for the condition poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSpec {
    /// Value the watched attribute must reach
    pub target: String,
    /// Name of the attribute being watched
    pub attribute: String,
    /// Upper bound on the whole wait, including `delay`
    pub timeout: Duration,
    /// Grace period before the first check
    pub delay: Duration,
    /// Pacing floor between polls
    pub min_timeout: Duration,
}

impl WaitSpec {
    pub fn new(attribute: impl Into<String>, target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            attribute: attribute.into(),
            timeout,
            delay: Duration::ZERO,
            min_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_min_timeout(mut self, min_timeout: Duration) -> Self {
        self.min_timeout = min_timeout;
        self
    }

    /// Shrink the timeout so the wait ends no later than `deadline`
    pub fn bounded_by(mut self, deadline: Instant) -> Self {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.timeout = self.timeout.min(remaining);
        self
    }

    /// Interval between polls, never zero
    pub fn poll_interval(&self) -> Duration {
        self.min_timeout.max(Duration::from_millis(1))
    }
}

/// Image record returned by the image catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Lookup parameters for an operating system image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageQuery {
    pub slug: Option<String>,
    pub name: Option<String>,
    pub distro: Option<String>,
    pub version: Option<String>,
}

impl ImageQuery {
    pub fn by_slug(slug: impl Into<String>) -> Self {
        Self {
            slug: Some(slug.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ResourceSpec {
        ResourceSpec::new("h1", "img-a", "p1", "s1")
    }

    fn snapshot(networks: Vec<NetworkAttachment>) -> ResourceSnapshot {
        ResourceSnapshot {
            id: "r-1".to_string(),
            state: LifecycleState::Active,
            allocation: Allocation {
                hostname: "h1".to_string(),
                name: "h1".to_string(),
                image: "img-a".to_string(),
                partition: "p1".to_string(),
                size: "s1".to_string(),
                networks,
                ..Default::default()
            },
            last_event: Some("Phoned Home".to_string()),
            created: Utc::now(),
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(spec().validate().is_ok());
        assert!(spec().with_name("web").with_tags(vec!["a=b".into()]).validate().is_ok());
    }

    #[test]
    fn test_missing_required_fields() {
        let mut s = spec();
        s.image = String::new();
        assert!(matches!(s.validate(), Err(Error::Validation { field: "image", .. })));

        let mut s = spec();
        s.partition = "  ".to_string();
        assert!(matches!(s.validate(), Err(Error::Validation { field: "partition", .. })));

        let mut s = spec();
        s.hostname = String::new();
        assert!(matches!(s.validate(), Err(Error::Validation { field: "hostname", .. })));
    }

    #[test]
    fn test_invalid_hostnames() {
        let too_long = "a".repeat(64);
        for bad in ["-h1", "h1-", "h_1", "h 1", too_long.as_str()] {
            let mut s = spec();
            s.hostname = bad.to_string();
            assert!(
                matches!(s.validate(), Err(Error::Validation { field: "hostname", .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_placeholder_key_is_deterministic() {
        let a = spec().key();
        let b = spec().with_description("ignored").key();
        let c = ResourceSpec::new("h2", "img-a", "p1", "s1").key();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_placeholder());
        assert!(!ResourceKey::from_id("r-1").is_placeholder());
    }

    #[test]
    fn test_replacement_fields() {
        let prior = spec().with_user_data("#cloud-config");
        let mut desired = prior.clone().with_name("renamed");
        assert!(desired.replacement_fields(&prior).is_empty());

        desired.image = "img-b".to_string();
        desired.partition = "p2".to_string();
        desired.user_data = None;
        assert_eq!(desired.replacement_fields(&prior), vec!["image", "partition", "user_data"]);
    }

    #[test]
    fn test_snapshot_attributes() {
        let snap = snapshot(vec![]);
        assert_eq!(snap.attribute("state").as_deref(), Some("Active"));
        assert_eq!(snap.attribute("last_event").as_deref(), Some("Phoned Home"));
        assert_eq!(snap.attribute("hostname").as_deref(), Some("h1"));
        assert_eq!(snap.attribute("description"), None);
        assert_eq!(snap.attribute("bogus"), None);
    }

    #[test]
    fn test_unknown_state_defaults_to_absent() {
        assert_eq!(LifecycleState::default(), LifecycleState::Absent);
        assert!(LifecycleState::default().is_terminal());
    }

    #[test]
    fn test_primary_network_required() {
        let snap = snapshot(vec![]);
        assert!(matches!(
            snap.primary_network(),
            Err(Error::MissingNetwork { operation: Operation::Read, id }) if id == "r-1"
        ));
    }

    #[test]
    fn test_access_addresses() {
        let snap = snapshot(vec![
            NetworkAttachment {
                network_id: "tenant".to_string(),
                ips: vec!["10.0.0.5".to_string()],
                private: true,
            },
            NetworkAttachment {
                network_id: "internet".to_string(),
                ips: vec!["185.1.2.3".to_string()],
                private: false,
            },
        ]);

        assert_eq!(snap.primary_network().unwrap().network_id, "tenant");
        assert_eq!(snap.access_private_ipv4(), Some("10.0.0.5"));
        assert_eq!(snap.access_public_ipv4(), Some("185.1.2.3"));
    }

    #[test]
    fn test_wait_spec_bounded_by_deadline() {
        let wait = WaitSpec::new("state", "Active", Duration::from_secs(3600))
            .bounded_by(Instant::now() + Duration::from_secs(5));
        assert!(wait.timeout <= Duration::from_secs(5));

        let wait = WaitSpec::new("state", "Active", Duration::from_secs(1)).with_min_timeout(Duration::ZERO);
        assert_eq!(wait.poll_interval(), Duration::from_millis(1));
    }
}
