//! Infrastructure and application layer: event store, unit of work, read
//! models, collaborators, configuration and the quotation workflow.

pub mod collaborators;
pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod workflow;


pub use collaborators::{
    CategoryMarginLookup, InMemoryCategoryMargins, InMemoryReferenceAllocator, ReferenceAllocator,
    ReferenceError,
};
pub use command_dispatcher::{CommandDispatcher, DispatchError, Tracked, UnitOfWork};
pub use config::{ConfigError, WorkflowConfig};
pub use projections::{RequestDirectory, RequestDirectoryError, RequestSummary};
pub use workflow::{
    LifecycleController, NewRequest, NewSalesLine, NewSalesOrder, OperationContext,
    ToggleOutcome, WorkflowError, WorkflowResult,
};
