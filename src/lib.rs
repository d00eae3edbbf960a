pub mod campaign;
pub mod classifier;
pub mod config;
pub mod confusables;
pub mod discovery;
pub mod executor;
pub mod orchestrator;
pub mod report;
pub mod stats;
pub mod telemetry;
pub mod transport;
pub mod variant;

pub use campaign::Campaign;
pub use config::{ConfigError, RunConfig};
pub use report::RunReport;
pub use variant::{Technique, Variant, VariantGenerator};
