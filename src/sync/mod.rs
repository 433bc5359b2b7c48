// Controller <-> robot state synchronization
//
// - `channel`: transport seam plus the in-memory transport
// - `zenoh_link`: zenoh pub/sub transport used on the real robot
// - `client`: controller-side cache, commands and reconnect loop

pub mod channel;
pub mod client;
pub mod zenoh_link;

pub use channel::{ChannelError, Link, Transport};
pub use client::SyncClient;
pub use zenoh_link::{Role, ZenohTransport};
