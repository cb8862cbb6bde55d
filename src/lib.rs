//! CrabScan: Cross-platform TWAIN scanner session management for Rust
//!
//! This crate drives TWAIN image-acquisition devices through the
//! native data source manager, with a strict session state machine,
//! typed capability negotiation, and thread-safe delivery of device
//! notifications.
//!
//! # Features
//! - Strict session state ladder with pre-call guards
//! - Triplet dispatch onto the single native entry point
//! - Typed capability containers (one value, range, enumeration, array)
//! - Source enumeration with per-session handle caching
//! - Device notifications bridged onto caller-chosen threads
//! - Native-memory and file transfer loops with cooperative cancel
//!
//! # Usage
//! Add this to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! crabscan = "0.3"
//! ```
//!
//! Then open a session against the platform manager:
//! ```rust,ignore
//! use crabscan::{DsmLibrary, Session, SessionConfig};
//!
//! let manager = DsmLibrary::load_default()?;
//! let session = Session::new(SessionConfig::new("My App", "My Co"), manager)?;
//! session.open(0)?;
//! for source in session.get_sources()? {
//!     println!("{}", source.name());
//! }
//! session.step_down(crabscan::State::DsmUnloaded)?;
//! ```
mod callback;
pub mod caps;
pub mod entry;
pub mod errors;
pub mod events;
pub mod session;
pub mod source;
pub mod threading;
pub mod triplet;
pub mod types;

// Testing utilities - scriptable manager double for offline testing
pub mod testing;

// Re-exports for convenience
pub use caps::{CapId, CapSupport, CapValue, Container, ContainerKind, Fix32, ItemType};
pub use entry::{DsmLibrary, NativeEntry};
pub use errors::TwainError;
pub use events::{EventSink, SessionEvent, TransferReadyEvent, TransferredData};
pub use session::Session;
pub use source::DataSource;
pub use threading::{DispatcherLoop, InlineContext, ThreadContext};
pub use triplet::Triplet;
pub use types::{
    ConditionCode, Dat, DataGroup, FileFormat, Msg, ReturnCode, SessionConfig, SourceEnableMode,
    State, TwIdentity, WindowHandle,
};

/// Initialize logging for the scanner session layer
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabscan=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        manager_library: entry::default_library_name().to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub manager_library: String,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "crabscan");
        assert!(!info.version.is_empty());
        assert!(!info.description.is_empty());
        assert!(!info.manager_library.is_empty());
    }

    #[test]
    fn test_crate_info_serializes() {
        let json = serde_json::to_string(&get_info()).unwrap();
        assert!(json.contains("crabscan"));
    }
}
