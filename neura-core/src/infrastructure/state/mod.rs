// neura-core/src/infrastructure/state/mod.rs

pub mod secrets;
pub mod store;

pub use secrets::SecretBox;
pub use store::{
    ConnectionUpsert, JobCreate, JobFilter, ScheduleCreate, ScheduleRunOutcome, StateStore,
    StepSeed, TemplateUpsert,
};
