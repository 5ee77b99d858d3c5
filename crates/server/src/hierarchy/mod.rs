// Credential → session → workspace token hierarchy with cascading invalidation.

pub mod links;
mod manager;
mod records;

pub use manager::{SessionHierarchyManager, TokenState, WorkspaceActivation, WorkspaceOrigin};
pub use records::{CredentialRecord, SessionRecord, WorkspaceRecord};
