//! Radio driver abstraction.
//!
//! The physical ANT radio is reached through a native driver; everything the
//! manager needs from it is captured by the [`RadioNode`] and [`RadioChannel`]
//! traits so the scheduling logic stays testable against a fake. The concrete
//! binding (or the [`sim`] driver) is injected at startup.

pub mod sim;

use thiserror::Error;

/// Driver error taxonomy.
///
/// The distinction matters for recovery: `WrongState` is retried in place,
/// `NoFreeChannel` fails a promotion gracefully, anything else gets the
/// affected channel torn down.
#[derive(Debug, Clone, Error)]
pub enum RadioError {
    /// The channel was not in a state that allows the operation (e.g. closing
    /// a channel the driver still considers searching). Transient.
    #[error("channel in wrong state")]
    WrongState,

    /// Every hardware channel is already assigned.
    #[error("no free hardware channel")]
    NoFreeChannel,

    /// Anything else the driver reports.
    #[error("driver error: {0}")]
    Driver(String),
}

impl RadioError {
    /// Transient errors are worth retrying on the same channel.
    pub fn is_transient(&self) -> bool {
        matches!(self, RadioError::WrongState)
    }
}

/// Callback invoked by the driver for every received broadcast payload.
///
/// Runs on a driver-owned thread; implementations must not block.
pub type BroadcastHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// One hardware receive channel, exclusively owned by its holder.
pub trait RadioChannel: Send {
    fn set_rf_freq(&mut self, rf_freq: u8) -> Result<(), RadioError>;
    fn set_period(&mut self, period: u16) -> Result<(), RadioError>;
    fn set_id(
        &mut self,
        device_id: u16,
        device_type: u8,
        transmission_type: u8,
    ) -> Result<(), RadioError>;
    fn enable_extended_messages(&mut self, enabled: bool) -> Result<(), RadioError>;
    fn set_search_timeout(&mut self, timeout: u8) -> Result<(), RadioError>;
    fn set_broadcast_handler(&mut self, handler: BroadcastHandler);
    fn clear_broadcast_handler(&mut self);
    fn open(&mut self) -> Result<(), RadioError>;
    fn close(&mut self) -> Result<(), RadioError>;
    /// Release the hardware channel slot back to the driver.
    fn unassign(&mut self) -> Result<(), RadioError>;
}

impl std::fmt::Debug for dyn RadioChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RadioChannel")
    }
}

/// The radio device itself: network key configuration, channel creation,
/// start/stop lifecycle.
pub trait RadioNode: Send {
    fn set_network_key(&self, network_number: u8, key: &[u8; 8]) -> Result<(), RadioError>;
    fn new_channel(&self) -> Result<Box<dyn RadioChannel>, RadioError>;
    fn start(&self) -> Result<(), RadioError>;
    fn stop(&self) -> Result<(), RadioError>;
}
