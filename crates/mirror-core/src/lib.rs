pub mod config;
pub mod destination;
pub mod error;
pub mod event;
pub mod mirror;
pub mod recorder;
pub mod reconciler;
pub mod schema;
pub mod store;
pub mod values;
pub mod view;

pub use config::MirrorConfig;
pub use destination::{DestinationDescriptor, TableRef};
pub use error::{MirrorError, MirrorResult, RowFailure};
pub use event::{ChangeEvent, Operation};
pub use mirror::Mirror;
pub use recorder::EventRecorder;
pub use reconciler::SchemaReconciler;
pub use schema::{DocumentSchema, FieldDefinition, FieldMode, FieldType, TableSchema};
pub use store::memory::InMemoryStore;
pub use store::{DestinationStore, StoreError, TableRow};
pub use values::{Fields, InsertId, Value};
pub use view::ViewDefinition;
