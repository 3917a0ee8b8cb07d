pub mod api;
pub mod config;
pub mod error;
pub mod executions;
pub mod manager;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod reconnect;
pub mod registry;
pub mod store;
pub mod surface;
pub mod transport;
pub mod ws;

pub use api::{ConsoleApi, HttpConsoleApi};
pub use config::DeckConfig;
pub use error::{DeckError, DeckResult};
pub use executions::{BusSettings, ExecutionBusHandle, ExecutionTable, Notification};
pub use manager::{
    ManagerHandle, ManagerSettings, RestoreReport, TerminalEvent, TerminalStatus, TerminalSummary,
};
pub use reconnect::{CloseDecision, ReconnectPhase, ReconnectPolicy, ReconnectState};
pub use registry::{PendingExecutionIndex, SessionRegistry, SessionRegistryEntry};
pub use store::StateStore;
pub use surface::{DisplaySurface, Geometry, MemorySurface, SurfaceFactory};
pub use transport::{ChannelEvent, ChannelState, Dialer, TransportChannel};
pub use ws::WsDialer;
