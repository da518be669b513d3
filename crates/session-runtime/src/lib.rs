//! Session supervision runtime: one sequential worker per instance, driven
//! through [`SessionController`] and fed by a [`Transport`] implementation.

mod controller;
mod registry;
/// Scripted transport used by tests and the smoke binary.
pub mod testing;
mod transport;
mod worker;

pub use controller::{
    Collaborators, ControllerSettings, DEFAULT_TEARDOWN_TIMEOUT, SessionController,
};
pub use registry::InstanceRegistry;
pub use transport::{Transport, TransportError, TransportHandle, TransportSession};
pub use worker::{InstanceHandle, InstanceSnapshot};
