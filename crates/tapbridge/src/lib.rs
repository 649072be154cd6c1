//! Host side of the tap bridge: the hypervisor stream socket, the Linux socket backend, the guest
//! network namespace and the event loop tying them to [`tapbridge_tcp::TcpEngine`].

pub mod config;
pub mod event_loop;
pub mod netns;
pub mod sys;
pub mod tap;

pub use config::{BridgeConfig, ConfigError};
pub use event_loop::run;
pub use netns::{Namespaces, NetnsMirror};
pub use sys::LinuxHost;
pub use tap::{QemuTap, TapError};
