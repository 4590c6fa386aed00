// neura-core/src/application/pipeline/mod.rs

// The five-stage template pipeline: Verify, Auto-Map, Corrections, Contract
// build, Generator assets. Each stage is a cache-keyed, validated,
// artifact-producing transformation executed under the template lock.

pub mod automap;
pub mod cache;
pub mod contract_build;
pub mod corrections;
pub mod generator;
pub mod prompts;
pub mod verify;

pub use automap::{AutoMapOutcome, automap_stage, run_automap_llm};
pub use contract_build::{ContractOutcome, contract_stage, run_contract_llm};
pub use corrections::{CorrectionsOutcome, corrections_stage, run_corrections_llm};
pub use generator::{GeneratorAssets, generator_stage, run_generator_llm};
pub use verify::{VerifyOutcome, verify_stage};
