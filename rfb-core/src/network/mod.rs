pub mod connection;
pub mod receiver;
pub mod sender;

pub use connection::{Connection, ConnectionContext, ConnectionInfo, RfbProtocol, SessionConfig};
pub use receiver::{MessageReceiver, ReceiverStats, SessionEvent};
pub use sender::MessageSender;
