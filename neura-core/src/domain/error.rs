// neura-core/src/domain/error.rs

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum DomainError {
    #[error("Invalid template id: {0}")]
    #[diagnostic(
        code(neura::domain::invalid_template_id),
        help("Template ids are lowercase slugs (3-181 chars) or UUIDs.")
    )]
    InvalidTemplateId(String),

    #[error("Template is currently processing another request: {0}")]
    #[diagnostic(
        code(neura::domain::template_locked),
        help("Retry once the in-flight pipeline or report run releases the lock.")
    )]
    TemplateLocked(String),

    #[error("Mapping validation failed: {0}")]
    #[diagnostic(code(neura::domain::mapping_invalid))]
    MappingValidation(String),

    #[error("Contract validation failed: {0}")]
    #[diagnostic(
        code(neura::domain::invalid_contract),
        help("Every token must be mapped and every binding must stay inside the catalog allow-list.")
    )]
    ContractValidation(String),

    #[error("Corrections validation failed: {0}")]
    #[diagnostic(code(neura::domain::corrections_invalid))]
    CorrectionsValidation(String),

    #[error("Generator assets rejected: {0}")]
    #[diagnostic(code(neura::domain::generator_invalid))]
    GeneratorValidation(String),

    #[error("Missing required parameter: {0}")]
    #[diagnostic(code(neura::domain::missing_parameter))]
    MissingParameter(String),

    #[error("Job was cancelled")]
    #[diagnostic(code(neura::domain::job_cancelled))]
    JobCancelled,

    #[error("Schedule rejected: {0}")]
    #[diagnostic(code(neura::domain::invalid_schedule))]
    InvalidSchedule(String),

    #[error("Validation error: {0}")]
    #[diagnostic(code(neura::domain::validation))]
    Validation(String),

    #[error("{entity} '{id}' not found")]
    #[diagnostic(code(neura::domain::not_found))]
    NotFound { entity: &'static str, id: String },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::InvalidTemplateId(_) => "invalid_template_id",
            DomainError::TemplateLocked(_) => "template_locked",
            DomainError::MappingValidation(_) => "mapping_llm_invalid",
            DomainError::ContractValidation(_) => "invalid_contract",
            DomainError::CorrectionsValidation(_) => "corrections_invalid",
            DomainError::GeneratorValidation(_) => "generator_invalid",
            DomainError::MissingParameter(_) => "missing_parameter",
            DomainError::JobCancelled => "job_cancelled",
            DomainError::InvalidSchedule(_) => "invalid_schedule",
            DomainError::Validation(_) => "validation_error",
            DomainError::NotFound { .. } => "not_found",
        }
    }
}
