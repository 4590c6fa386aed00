// neura-core/src/infrastructure/error.rs

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum DatabaseError {
    #[error("DataFusion Engine Error: {0}")]
    #[diagnostic(
        code(neura::infra::database::datafusion),
        help("An error occurred inside the SQL engine.")
    )]
    DataFusion(#[from] datafusion::error::DataFusionError),

    #[error("SQLite Error: {0}")]
    #[diagnostic(
        code(neura::infra::database::sqlite),
        help("Check the source database file and its schema.")
    )]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Error, Debug, Diagnostic)]
pub enum InfrastructureError {
    // --- DATABASE (Abstracted) ---
    #[error(transparent)]
    #[diagnostic(transparent)]
    Database(#[from] DatabaseError),

    // --- FILESYSTEM (IO) ---
    #[error("File System Error: {0}")]
    #[diagnostic(
        code(neura::infra::io),
        help("Check file permissions or path validity.")
    )]
    Io(#[from] std::io::Error),

    // --- JSON / YAML ---
    #[error("JSON Error: {0}")]
    #[diagnostic(code(neura::infra::json))]
    Json(#[from] serde_json::Error),

    #[error("YAML Parsing Error: {0}")]
    #[diagnostic(
        code(neura::infra::yaml),
        help("Check your YAML syntax (indentation, types).")
    )]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    // --- HTTP / LLM PROVIDER ---
    #[error("HTTP Error: {0}")]
    #[diagnostic(
        code(neura::infra::http),
        help("Provider unreachable or returned a transport-level failure.")
    )]
    Http(#[from] reqwest::Error),

    #[error("LLM provider error: {0}")]
    #[diagnostic(code(neura::infra::llm))]
    LlmProvider(String),

    // --- TEMPLATING ---
    #[error("Template Rendering Error: {0}")]
    #[diagnostic(
        code(neura::infra::template),
        help("Check the Jinja syntax ({{ ... }}) inside the prompt template.")
    )]
    Template(#[from] minijinja::Error),

    // --- CRYPTO ---
    #[error("Secret store error: {0}")]
    #[diagnostic(
        code(neura::infra::crypto),
        help("The state secret may have changed; re-save the connection credentials.")
    )]
    Crypto(String),

    // --- EMAIL ---
    #[error("Mail transport error: {0}")]
    #[diagnostic(code(neura::infra::mail))]
    Mail(String),

    // --- IMAGES ---
    #[error("Image processing error: {0}")]
    #[diagnostic(code(neura::infra::image))]
    Image(String),
}

// Shortcuts for `?` on engine calls.
impl From<datafusion::error::DataFusionError> for InfrastructureError {
    fn from(err: datafusion::error::DataFusionError) -> Self {
        InfrastructureError::Database(DatabaseError::DataFusion(err))
    }
}

impl From<rusqlite::Error> for InfrastructureError {
    fn from(err: rusqlite::Error) -> Self {
        InfrastructureError::Database(DatabaseError::Sqlite(err))
    }
}
