pub mod catalog;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod profile;
pub mod proxy_config;
pub mod remote;
pub mod service;
pub mod settings;
pub mod store;

pub use catalog::SubscriptionCatalog;
pub use error::{Error, Result};
pub use manager::GlobalConfig;
pub use monitor::{NetMonitor, NetSpeed, SystemStatus};
pub use profile::{ProxyDescriptor, ProxyFile, Subscription};
pub use proxy_config::{
    Hysteria2Config, ListenPorts, ProxyConfig, ProxyConfigFactory, ProxyProtocol,
};
pub use remote::RemoteFetcher;
pub use service::{ProcessSupervisor, SupervisorState};
pub use settings::{GlobalSettings, SettingReader};
pub use store::Store;
