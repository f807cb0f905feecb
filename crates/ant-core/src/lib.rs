pub mod antfs;
pub mod codec;
mod config;
mod error;
mod host_state;
mod known_devices;
pub mod message;
mod registry;

pub use codec::{Codec, Tokenizer};
pub use config::{HostConfig, SessionConfig};
pub use error::{AntError, EventCode};
pub use host_state::{HostContext, HostEvent, HostMachine, HostState, State};
pub use known_devices::{KnownDevice, KnownDeviceDb, KnownDevices};
pub use message::Message;
pub use registry::{Descriptor, Direction, Matcher, Registry, RetryPolicy, Validator};
