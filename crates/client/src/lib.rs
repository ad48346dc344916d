// fieldsync-client: local-first replicas of server tables with optimistic writes.

pub mod adapter;
pub mod backend;
pub mod collection;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod registry;
pub mod shape;
pub mod store;

pub use collection::{Collection, CollectionOptions, CollectionStatus};
pub use error::{AdapterError, CollectionError, MutationError, ShapeError};
pub use reconciler::MutationOutcome;
pub use registry::{CollectionRegistry, ProjectCollections, ResumePositions};
pub use store::{ChangeKind, CollectionEvent};
