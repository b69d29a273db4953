//! # Girder core model
//!
//! The shared vocabulary of the girder execution engine:
//!
//! - **Work specifications**: [`WorkSpec`] describes one unit of work by
//!   kind, name, and parameters; [`ContainerJobSpec`] extends it for
//!   container runtimes with secret redaction.
//! - **Runs and the state machine**: [`Run`], [`RunEvent`], [`DeadLetter`],
//!   and the validated transition graph on [`RunStatus`].
//! - **Handler registry**: explicit (kind, name) → [`Handler`]
//!   registration with per-kind namespaces.
//! - **Workflow model**: [`workflow::Workflow`] blueprints, steps, the
//!   immutable context, and result envelopes.
//! - **Retry policy values**: [`retry::RetryPolicy`] and backoff curves.
//!
//! This crate holds no I/O. Persistence lives in `girder-storage`,
//! execution in `girder-engine`.

pub mod canonical;
pub mod container;
pub mod error;
pub mod id;
pub mod registry;
pub mod retry;
pub mod run;
pub mod runtime;
pub mod status;
pub mod work;
pub mod workflow;

pub use container::{ContainerJobSpec, ResourceLimits, VolumeMount};
pub use error::{ErrorCategory, WorkError};
pub use id::RunId;
pub use registry::{async_handler_fn, handler_fn, Handler, HandlerRegistry, RegistryError};
pub use retry::{Backoff, RetryContext, RetryDecision, RetryPolicy};
pub use run::{DeadLetter, Run, RunEvent, RunEventType};
pub use status::{InvalidTransition, RunStatus};
pub use work::{params, Params, WorkKind, WorkSpec};
