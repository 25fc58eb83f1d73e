//! IPFIX template, session and transcoding core.
//!
//! This crate implements the RFC 7011 wire protocol core used by ZenSight:
//!
//! - [`infomodel`] - Information elements and the shared information model
//! - [`template`] - Ordered field layouts, frozen once attached to a session
//! - [`record`] - In-memory records and structured data (RFC 6313 lists)
//! - [`session`] - Template tables per observation domain, pairing, observers
//! - [`metadata`] - Template metadata (RFC 6313/CERT) and element types (RFC 5610)
//! - [`transcoder`] - Record transcoding between templates and wire encoding
//! - [`message`] - Message framing for export and collection
//! - [`transport`] - Exporter and collector traits with in-memory and stream adapters
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use zensight_ipfix::{AUTO, ElementSpec, InfoModel, MemoryExporter, MessageBuffer, Record,
//!     Session, Template, TemplateTable, Value};
//!
//! let mut session = Session::new(Arc::new(InfoModel::with_defaults()));
//! let template = Arc::new(Template::from_specs(session.model(), &[
//!     ElementSpec::new("sourceIPv4Address", 0, 0),
//!     ElementSpec::new("octetTotalCount", 0, 0),
//! ])?);
//! let tid = session.add_template(TemplateTable::External, AUTO, template.clone(), None)?;
//!
//! let mut buffer = MessageBuffer::for_export(session, MemoryExporter::new());
//! buffer.export_templates()?;
//! buffer.set_export_template(tid)?;
//!
//! let mut record = Record::new(template);
//! record.set_by_name("sourceIPv4Address", Value::Ipv4("1.2.3.4".parse()?))?;
//! record.set_by_name("octetTotalCount", Value::Unsigned(1000))?;
//! buffer.append(&record)?;
//! buffer.emit()?;
//! ```

pub mod config;
pub mod error;
pub mod infomodel;
pub mod message;
pub mod metadata;
pub mod record;
pub mod session;
pub mod template;
pub mod transcoder;
pub mod transport;

// Re-export commonly used types at the crate root
pub use config::{BufferOptions, IpfixConfig, LogFormat, LoggingConfig, parse_config};
pub use error::{Error, Result, TemplateError};
pub use infomodel::{DataType, InfoElement, InfoModel, Semantics, Units, VARLEN};
pub use message::{FrameState, MessageBuffer};
pub use metadata::{MetadataKind, TemplateInfo, TemplateParent};
pub use record::{
    BasicList, ListSemantic, Record, SubTemplateList, SubTemplateMultiList, Value, Varfield,
};
pub use session::{AUTO, Session, TemplateAction, TemplateObserver, TemplateTable};
pub use template::{CompareOptions, CopyOptions, ElementSpec, SetRelation, Template};
pub use transcoder::{PlanCache, Transcoder};
pub use transport::{
    Collector, Exporter, MemoryCollector, MemoryExporter, StreamCollector, StreamExporter,
};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
