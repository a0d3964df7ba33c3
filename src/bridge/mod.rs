//! Userspace packet bridge
//!
//! Each virtual interface owns one [`PacketBridge`]. Ingress IP packets feed
//! a userspace TCP/IP stack; accepted flows are relayed through whichever
//! dialer the interface is bound to; reply packets come back out through the
//! interface's delivery slot.

mod bridge;
mod channel;
pub mod config;
mod flow;
mod packet;

pub use bridge::{BridgeCounters, BridgeCountersSnapshot, PacketBridge};
pub use channel::StackChannel;
pub use flow::{FlowEntry, FlowKey, FlowState, FlowTable};
pub use packet::{parse_packet, ParsedPacket, PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP, PROTO_UDP};
