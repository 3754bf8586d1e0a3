pub mod plugin;
pub mod registry;
pub mod router;

pub use plugin::{ClientInfo, Plugin, SessionHandle, VersionPredicate};
pub use registry::PluginRegistry;
pub use router::ClientRouter;
