// neura-core/src/ports/mod.rs

pub mod connector;
pub mod llm;
pub mod mailer;
pub mod process;
pub mod render;

pub use connector::{AnalyticConnector, ColumnSchema, QueryResult};
pub use llm::{ChatModel, ChatRequest, UserPart};
pub use mailer::{Mailer, OutboundEmail};
pub use process::ProcessTracker;
pub use render::{
    DocxConverter, DocxHints, PageRenderer, PdfOptions, PdfRasterizer, Viewport, XlsxExporter,
};
