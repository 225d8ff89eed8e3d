pub mod cluster;
pub mod mock_network;

pub use cluster::MockCluster;
pub use mock_network::{MockNetworkHub, MockNetworkHubConfig, MockNodeConfig, MockTransport};
