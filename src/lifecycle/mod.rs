//! Process lifecycle: termination and reload signals

mod reload;
mod shutdown;

pub use reload::ConfigReloader;
pub use shutdown::{spawn_signal_adapter, ShutdownSignal};
