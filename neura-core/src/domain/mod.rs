// neura-core/src/domain/mod.rs

pub mod connection;
pub mod contract;
pub mod error;
pub mod job;
pub mod report_run;
pub mod schedule;
pub mod template;
pub mod tokens;

pub use connection::{ConnectionRecord, ConnectionView};
pub use contract::{Binding, Contract, validate_contract};
pub use error::DomainError;
pub use job::{JobRecord, JobStatus, JobStep, StepStatus};
pub use report_run::ReportRunRecord;
pub use schedule::{RunPayload, ScheduleRecord, normalize_email_targets};
pub use template::{TemplateKind, TemplateRecord, TemplateStatus, normalize_template_id};
