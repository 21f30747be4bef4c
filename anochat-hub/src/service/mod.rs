pub mod bootstrap;
pub mod wire;

pub use bootstrap::{ApplicationBootstrap, install_signal_handler};
pub use wire::ApplicationContext;
