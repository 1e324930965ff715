//! Podshift Core Library
//!
//! Pod live-migration orchestrator. Moves a running pod from a source node
//! to a destination node with checkpoint/restore through the CRI, either
//! committing fully or rolling back with the source left untouched.
//! Provides pod selection and capture, the checkpoint bundle codec, the
//! transfer protocol, restore, the durable record store and the migration
//! state machine.

pub mod bundle;
pub mod capture;
pub mod config;
pub mod error;
pub mod integrity;
pub mod machine;
pub mod record;
pub mod restore;
pub mod retry;
pub mod runtime;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod transfer;
pub mod types;

// Re-export commonly used types
pub use bundle::{BundleCodec, CheckpointArtifact, CheckpointBundle, FORMAT_VERSION};
pub use capture::{select_pod, CaptureEngine};
pub use config::{Config, ConfigLoader, DestinationConfig};
pub use error::{HardValidationError, MigrationError, MigrationResult, RpcCode};
pub use machine::{Destination, MigrationStateMachine};
pub use record::{ContainerFailure, MigrationOptions, MigrationRecord, StageDeadlines};
pub use restore::{RestoreEngine, RestoreReport};
pub use retry::RetryPolicy;
pub use runtime::{CrictlClient, ImageService, NodeClients, RuntimeService};
pub use state::MigrationState;
pub use store::{MigrationStore, RecordScan};
pub use transfer::{
    ConfirmationKey, LocalDirTransport, TransferConfirmation, TransferCoordinator, Transport,
};
pub use types::{ContainerId, MigrationId, NodeName, PodRef, PodSelector, SandboxId};
