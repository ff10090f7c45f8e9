pub mod catalog;
pub mod error;
pub mod recovery;
pub mod runner;
pub mod spec;
pub mod state;
pub mod task;

pub use catalog::{CatalogClient, CatalogError, MemoryCatalog, RestCatalog};
pub use error::{ReconcileError, Result};
pub use runner::{RunSummary, StepReport, TaskRunner};
pub use spec::InfraSpec;
pub use state::{InfraState, JsonFileStore, NoopStore, Reference, StateError, StateStore};
pub use task::{EnsurerContext, Outcome, Task};
