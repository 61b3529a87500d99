pub mod error;
pub mod manager;
pub mod package;
pub mod pin;
pub mod task;

pub use error::{CoreError, CoreErrorKind};
pub use manager::{
    ActionSafety, AuthorityClass, CapabilitySet, ManagerAction, ManagerDescriptor, ManagerId,
};
pub use package::{InstalledPackage, OutdatedPackage, PackageRef};
pub use pin::PinRecord;
pub use task::{ActionParams, TaskId, TaskPatch, TaskRecord, TaskSnapshot, TaskStatus};
