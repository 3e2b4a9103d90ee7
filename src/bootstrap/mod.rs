pub mod coordinator;
pub mod credentials;
pub mod identity;
pub mod store;

pub use coordinator::{BootstrapCoordinator, BootstrapOutcome, SkipReason, StepOutcome, Strategy};
pub use credentials::{CredentialProvider, ElevatedHandle, RestrictedHandle};
pub use identity::{Identity, IdentityId, Role};
pub use store::{AdminProcedures, ProfileStore};
