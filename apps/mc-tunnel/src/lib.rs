pub mod config;
pub mod error;
pub mod establish;
pub mod observer;
pub mod proxy;
pub mod session;
pub mod signal;
pub mod telemetry;
pub mod timeout;
pub mod token_file;
pub mod transport;

pub use config::TunnelConfig;
pub use error::{ChannelError, TunnelError};
pub use establish::ConnectionEstablisher;
pub use observer::{LinkStatus, NoopObserver, Notifier, Observer};
pub use proxy::{HostProxy, JoinerProxy, ProxyHandle};
pub use session::{Role, SessionPhase, TunnelSession};
pub use signal::{SdpKind, SessionDescription, Token};
pub use transport::TunnelChannel;
