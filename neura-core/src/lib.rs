// neura-core/src/lib.rs

// 1. Mandatory documentation for production code
#![allow(missing_docs)]

// 2. Memory safety
#![deny(unsafe_code)]
// 3. Robustness
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
// 4. Performance
#![warn(clippy::perf)]

// --- MODULES HEXAGONAUX ---

// 1. Ports (Interfaces / Traits)
// Chat model, page renderer, rasterizer, converters, mailer, connector.
pub mod ports;

// 2. Domain (business core)
// Contract model, templates, jobs, schedules, token grammar.
// Depends on NOTHING else (no infra, no app).
pub mod domain;

// 3. Infrastructure (Adapters)
// State store, artifact store, template lock, OpenAI client, DataFusion,
// sqlite introspection, SMTP mailer.
// Depends on the Domain and the Ports.
pub mod infrastructure;

// 4. Application (Use Cases)
// Pipeline stages, SQL executor, renderer, job engine, scheduler,
// report orchestrator.
// Depends on the Domain, the Infra and the Ports.
pub mod application;

// --- GESTION DES ERREURS GLOBALE ---
pub mod error;

// --- RE-EXPORTS (FACADE) ---
// Allows importing the main error easily: use neura_core::NeuraError;
pub use error::NeuraError;
