//! mvirt-provider: declarative resource management for the mvirt cluster API.
//!
//! Reconciles locally declared resources (virtual machines, load balancers)
//! with their objects in the cluster API.
//!
//! # Architecture
//!
//! ```text
//! ConfigRecord --build--> Remote object --RemoteStore--> cluster API
//!      ^                                                     |
//!      +--------------------project--------------------------+
//! ```
//!
//! [`ResourceAdapter`] drives the create/read/update/delete lifecycle of one
//! resource kind. Each kind plugs in through [`ResourceKind`].

pub mod client;
pub mod config;
pub mod error;
pub mod id;
pub mod projection;
pub mod resource;
pub mod schema;
pub mod wait;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use client::{ApiResource, ObjectMeta, RemoteStore, RestClient, StoreError};
pub use config::{ProviderConfig, Timeouts};
pub use error::{Operation, ProviderError, Result};
pub use id::ResourceId;
pub use projection::Drift;
pub use resource::{
    LoadBalancerKind, ReadOutcome, ResourceAdapter, ResourceData, ResourceKind, ResourceState,
    VirtualMachineKind,
};
pub use schema::{ConfigRecord, Schema, ValidationError};
pub use wait::{Poll, WaitError, Waiter};
