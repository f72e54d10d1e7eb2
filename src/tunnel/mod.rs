pub mod client;
pub mod data_plane;
pub mod frame;
pub mod registry;
pub mod server;
pub mod session;

use crate::lifecycle::LifecycleManager;

pub type TunnelServerManager = LifecycleManager<server::TunnelControlServer>;
