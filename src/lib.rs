pub mod config;
pub mod error;
pub mod logging;
pub mod mutation;
pub mod providers;
pub mod proxy;
pub mod registry;
pub mod retry;
pub mod server;
pub mod translate;
pub mod transport;

pub use config::RouterConfig;
pub use error::{FaultKind, Result, RouterError};
pub use logging::SharedLogger;
pub use proxy::{InboundCall, Relay, RelayReply};
pub use registry::{ModelRoute, Registry, RegistryHandle};
pub use server::{build_router, AppState};
pub use transport::{HttpTransport, Transport};
