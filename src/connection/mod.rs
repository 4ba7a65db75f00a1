/*!
 * Connection Module
 * Channel lifecycle to the privileged helper
 */

pub mod manager;
pub mod proxy;
pub mod state;
pub mod traits;
pub mod unix;

pub use manager::ConnectionManager;
pub use proxy::ExecutorProxy;
pub use state::ConnectionState;
pub use traits::{ChannelConnector, ExecutionChannel, SharedChannel};
pub use unix::{UnixChannel, UnixConnector};
