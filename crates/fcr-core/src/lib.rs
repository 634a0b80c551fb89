//! Fleet Command Runner core: vendor registry, device resolver, transport,
//! prompt matcher, session state machine, session registry, and dispatcher.
//!
//! This crate is the domain core only — the RPC transport, the device
//! inventory backend, and process-level concerns (config loading, logging
//! setup, metrics export, packaging) are external collaborators consumed
//! through the seams this crate defines (`DeviceInventory`, `TransportFactory`,
//! `PeerDispatcher`) rather than implemented here.

pub mod counters;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod prompt_matcher;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod transport;
pub mod vendor;

pub use device::{DeviceInventory, DeviceRecord, DeviceSnapshot, SessionData, StaticInventory};
pub use dispatcher::{Dispatcher, DispatcherConfig, PeerDispatcher};
pub use error::{FcrError, FcrErrorCode, Result};
pub use registry::SessionRegistry;
pub use resolver::{DeviceResolver, ResolvedTarget};
pub use session::{CommandResult, Owner, Session, SessionState};
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
pub use vendor::{PromptPattern, SessionKind, VendorProfile, VendorRegistry};
