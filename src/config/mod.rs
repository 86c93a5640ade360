//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → schema.rs (MICRO_EXT_IP / MICRO_EXT_PORT overrides)
//!     → validation.rs (semantic checks)
//!     → MeshConfig (validated, immutable)
//!     → owned by the service instance
//! ```
//!
//! # Design Decisions
//! - Config is immutable once a service starts
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::DirectoryConfig;
pub use schema::ListenerConfig;
pub use schema::MeshConfig;
pub use schema::ObservabilityConfig;
pub use schema::RequestConfig;
pub use schema::StoreConfig;
