use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable key naming one backend. Cheap to clone; the registry hands these out.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManagerId(Arc<str>);

impl ManagerId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ManagerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ManagerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ManagerId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Bulk-execution class. Variant order is phase order.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityClass {
    Authoritative,
    Standard,
    Guarded,
}

impl AuthorityClass {
    pub const PHASE_ORDER: [AuthorityClass; 3] = [
        AuthorityClass::Authoritative,
        AuthorityClass::Standard,
        AuthorityClass::Guarded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authoritative => "authoritative",
            Self::Standard => "standard",
            Self::Guarded => "guarded",
        }
    }
}

impl Display for AuthorityClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthorityClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "authoritative" => Ok(Self::Authoritative),
            "standard" => Ok(Self::Standard),
            "guarded" => Ok(Self::Guarded),
            other => Err(format!("unknown authority class '{other}'")),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ManagerAction {
    ListInstalled,
    ListOutdated,
    Search,
    Install,
    Uninstall,
    Upgrade,
    Pin,
    Unpin,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ActionSafety {
    ReadOnly,
    Mutating,
}

impl ManagerAction {
    pub const ALL: [ManagerAction; 8] = [
        ManagerAction::ListInstalled,
        ManagerAction::ListOutdated,
        ManagerAction::Search,
        ManagerAction::Install,
        ManagerAction::Uninstall,
        ManagerAction::Upgrade,
        ManagerAction::Pin,
        ManagerAction::Unpin,
    ];

    pub fn safety(self) -> ActionSafety {
        match self {
            Self::ListInstalled | Self::ListOutdated | Self::Search => ActionSafety::ReadOnly,
            Self::Install | Self::Uninstall | Self::Upgrade | Self::Pin | Self::Unpin => {
                ActionSafety::Mutating
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListInstalled => "list_installed",
            Self::ListOutdated => "list_outdated",
            Self::Search => "search",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Upgrade => "upgrade",
            Self::Pin => "pin",
            Self::Unpin => "unpin",
        }
    }
}

impl Display for ManagerAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagerAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == value)
            .ok_or_else(|| format!("unknown manager action '{value}'"))
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<ManagerAction>);

impl CapabilitySet {
    pub fn supports(&self, action: ManagerAction) -> bool {
        self.0.contains(&action)
    }

    pub fn iter(&self) -> impl Iterator<Item = ManagerAction> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ManagerAction> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = ManagerAction>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ManagerDescriptor {
    pub id: ManagerId,
    pub display_name: String,
    pub authority: AuthorityClass,
    pub capabilities: CapabilitySet,
}

impl ManagerDescriptor {
    pub fn supports(&self, action: ManagerAction) -> bool {
        self.capabilities.supports(action)
    }
}
