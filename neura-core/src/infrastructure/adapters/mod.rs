// neura-core/src/infrastructure/adapters/mod.rs

pub mod datafusion;

pub use datafusion::DataFusionConnector;
