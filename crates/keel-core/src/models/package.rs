use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::models::ManagerId;

/// Composite (manager, package) key. Plan steps and pins correlate on it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PackageRef {
    pub manager: ManagerId,
    pub name: String,
}

impl PackageRef {
    pub fn new(manager: ManagerId, name: impl Into<String>) -> Self {
        Self {
            manager,
            name: name.into(),
        }
    }
}

impl Display for PackageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.manager, self.name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutdatedPackage {
    pub package: PackageRef,
    pub installed_version: Option<String>,
    pub candidate_version: String,
    /// Pinned natively by the manager itself, as reported by the adapter.
    #[serde(default)]
    pub pinned: bool,
}

/// One entry of a manager's installed inventory.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub package: PackageRef,
    pub installed_version: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}
