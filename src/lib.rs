//! Dynamic ANT+ channel allocation for multi-device heart-rate tracking.
//!
//! The radio exposes a small fixed number of simultaneous receive channels.
//! One is kept scanning as a wildcard for discovery; the rest are handed out
//! as dedicated per-device channels, promoted and reclaimed on the fly as
//! heart-rate monitors appear and go quiet. The latest reading per device is
//! published through [`readings::SharedReadingTable`] for downstream
//! consumers.

pub mod ant;
pub mod config;
pub mod manager;
pub mod radio;
pub mod readings;
