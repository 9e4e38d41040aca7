#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use rmqtt_impexp::broker::memory::MemoryBroker;
//! use rmqtt_impexp::claims::ClaimedClientIds;
//! use rmqtt_impexp::conf::{Options, Settings};
//! use rmqtt_impexp::context::ImpexpContext;
//! use rmqtt_impexp::types::{ExportRequest, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::new(Options::default())?;
//!     rmqtt_impexp::logger::init_logger(&settings.log)?;
//!
//!     let claims = ClaimedClientIds::new();
//!     let broker = MemoryBroker::new(claims.clone());
//!     let ctx = ImpexpContext::new(settings, broker.broker(), claims);
//!
//!     let req = ExportRequest {
//!         client_id: Some("^sensor-".into()),
//!         topic: None,
//!         file_name: "sensors.bin".into(),
//!         password: "secret".into(),
//!         options: RequestOptions::OVERWRITE,
//!     };
//!     let (request_id, result) = ctx.export_resources_async(req).await;
//!     log::info!("export {} finished, {:?}", request_id, result);
//!     Ok(())
//! }
//! ```

/// Engine Core
pub mod context; // Shared engine context and public operations
pub mod export; // Export orchestrator
pub mod import; // Import scheduler and per-record state machines
pub mod manager; // Admission control and request ids

/// Supporting Services
pub mod claims; // Client ids reserved by running imports
pub mod dedup; // Messages already written by an export
pub mod diag; // Per-request diagnostics
pub mod logger; // log -> slog bridge
pub mod status; // Status side-channel files

/// Broker Collaborators
pub mod broker; // Traits implemented by the hosting broker, plus an in-memory broker

/// Common Types
pub mod error;
pub mod types;

pub use error::ImpexpError;

pub type Result<T, E = ImpexpError> = anyhow::Result<T, E>;

/// Re-exports
pub use rmqtt_impexp_codec as codec; // Container codec
pub use rmqtt_impexp_conf as conf; // Settings
pub use rmqtt_impexp_utils as utils; // Common utilities
