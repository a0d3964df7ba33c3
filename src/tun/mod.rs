//! Virtual interfaces and egress delivery

pub mod config;
pub mod delivery;
mod manager;

pub use config::{TunOptions, DEFAULT_MTU, DEFAULT_OUTPUT_CAPACITY};
pub use delivery::{DeliveryMode, DeliverySlot, DeliverySnapshot, PacketHandler};
pub use manager::{BindingInfo, TunInfo, TunInterface, TunManager};
