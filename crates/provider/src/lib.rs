//! Metal Machine Provider
//!
//! Reconciles declared machine specs with the machines a metal API
//! actually provisioned: create, wait for readiness, read back, delete.

pub mod client;
pub mod config;
pub mod image;
pub mod lock;
pub mod poller;
pub mod reconciler;

pub use client::{ImageCatalog, MetalClient, RemoteResourceClient, PHONED_HOME_EVENT};
pub use config::ProviderConfig;
pub use image::read_image;
pub use lock::{KeyGuard, ResourceKeyLock};
pub use poller::{ConditionPoller, Observation};
pub use reconciler::{ApplyAction, ApplyOutcome, LifecycleReconciler, PriorState};
