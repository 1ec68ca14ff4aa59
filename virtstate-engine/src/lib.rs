//! # virtstate Engine
//!
//! Declarative instance state convergence for Incus-style hypervisors.
//!
//! The engine consumes an [`InstanceModel`] describing one desired instance
//! and drives the remote toward it: validation, creation dispatch (image,
//! backup archive, copy, empty), start/stop with operational polling, file
//! pushes, and the read-back sync that re-derives the model from the live
//! remote object.
//!
//! ## Architecture
//!
//! ```text
//! InstanceModel ──▶ validate ──▶ InstanceReconciler ──▶ InstanceServer
//!                                      │                     │
//!                                lifecycle/poll         remote state
//!                                      │                     │
//!                                sync_state ◀────────────────┘
//! ```

pub mod convert;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod network;
pub mod poll;
pub mod provider;
pub mod reconciler;
pub mod validate;

pub use error::{Diagnostic, Diagnostics, EngineError, Result};
pub use model::{
    CreationSource, DeviceSpec, DeviceType, FileSpec, ImageRef, ImportRequest, InstanceModel,
    ProfileSpec, SourceInstance,
};
pub use poll::PollConfig;
pub use provider::{Provider, ProviderSettings};
pub use reconciler::InstanceReconciler;
pub use validate::{validate, validate_update};
