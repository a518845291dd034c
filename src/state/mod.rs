//! Deployment state: models and the embedded store

pub mod models;
pub mod store;

pub use models::{
    AppDeploymentRecord, DeployedResourceRecord, DeploymentRecord, DeploymentStatus,
    HelmReleaseRecord, ResourceAction,
};
pub use store::{StateStore, WriterLock};
