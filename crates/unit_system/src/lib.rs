//! # Unit System
//!
//! The contract every service unit implements, the context units receive, and
//! the registry that discovers and orders them.
//!
//! Units are plain structs implementing [`Unit`]. Every hook has a default, so a
//! unit only writes the ones it needs and advertises them through
//! [`Unit::capabilities`]. Whether a unit runs on the server or the client side
//! is decided by its name (see [`NamingConvention`]); within a kind, units run
//! in ascending [`Unit::priority`], ties kept in declaration order.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use unit_system::{ConnectionId, LogLevel, Unit, UnitContext, UnitError};
//!
//! struct GreeterService;
//!
//! #[async_trait]
//! impl Unit for GreeterService {
//!     fn name(&self) -> &str {
//!         "GreeterService"
//!     }
//!
//!     async fn connection_init(
//!         &self,
//!         context: Arc<dyn UnitContext>,
//!         connection: ConnectionId,
//!     ) -> Result<(), UnitError> {
//!         context.log(LogLevel::Info, &format!("greeting {}", connection));
//!         Ok(())
//!     }
//! }
//! ```

mod context;
mod registry;
mod unit;

pub use context::{ContextError, LogLevel, UnitContext};
pub use registry::{NamingConvention, RegistryError, UnitKind, UnitRegistry};
pub use unit::{ConnectionId, Unit, UnitCapabilities, UnitError, DEFAULT_PRIORITY};

// Re-exported so unit crates need only this one dependency.
pub use hearth_event_system::{EventSystem, NamedEvent};
pub use session_store::{Session, SessionError, SessionStore};
