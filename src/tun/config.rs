//! Interface options

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::delivery::DeliveryMode;

/// Default interface MTU
pub const DEFAULT_MTU: u16 = 1500;

/// Default polling ring capacity, in packets
pub const DEFAULT_OUTPUT_CAPACITY: usize = 512;

const MIN_MTU: u16 = 576;

/// Options for creating one virtual interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunOptions {
    /// Addresses assigned to the interface, recorded for diagnostics
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Delivery mode preset at creation; `Unset` defers the choice
    #[serde(default)]
    pub mode: DeliveryMode,
    /// Capacity of the output ring or callback queue, in packets
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,
    /// Host-owned file descriptor backing the interface, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<i32>,
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_output_capacity() -> usize {
    DEFAULT_OUTPUT_CAPACITY
}

impl Default for TunOptions {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            mtu: DEFAULT_MTU,
            mode: DeliveryMode::Unset,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            fd: None,
        }
    }
}

impl TunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU {
            return Err(Error::config(format!(
                "mtu {} below minimum {MIN_MTU}",
                self.mtu
            )));
        }
        if self.output_capacity == 0 {
            return Err(Error::config("output_capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(TunOptions::default().validate().is_ok());
    }

    #[test]
    fn rejects_tiny_mtu_and_zero_capacity() {
        let mut opts = TunOptions {
            mtu: 100,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
        opts.mtu = DEFAULT_MTU;
        opts.output_capacity = 0;
        assert!(opts.validate().is_err());
    }
}
