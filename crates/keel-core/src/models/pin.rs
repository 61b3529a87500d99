use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::PackageRef;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PinRecord {
    pub package: PackageRef,
    pub pinned_version: Option<String>,
    pub created_at: SystemTime,
}

impl PinRecord {
    pub fn new(package: PackageRef, pinned_version: Option<String>) -> Self {
        Self {
            package,
            pinned_version,
            created_at: SystemTime::now(),
        }
    }
}
