//! Configuration: parsing, validation, inheritance, and source resolution

pub mod legacy;
pub mod model;
pub mod phases;
pub mod resolver;
pub mod settings;
pub mod validate;

pub use model::{App, AppCommon, ChartSource, HelmApp, UnifiedConfig};
pub use phases::{load_workspace, PhaseNode};
pub use resolver::{resolve, ResolvedSource};
pub use settings::{EffectiveSettings, Settings};
pub use validate::ValidationReport;
