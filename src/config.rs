// src/config.rs
//! Per-node configuration.

use std::net::Ipv6Addr;
use std::time::Duration;

use crate::error::{Result, RplError};
use crate::objective::ObjectiveFunction;
use crate::option::DodagConfiguration;
use crate::packet::{
    DEFAULT_DEFAULT_LIFETIME, DEFAULT_DIO_INTERVAL_DOUBLINGS, DEFAULT_DIO_INTERVAL_MIN,
    DEFAULT_DIO_REDUNDANCY_CONSTANT, DEFAULT_LIFETIME_UNIT, DEFAULT_MIN_HOP_RANK_INCREASE,
    DEFAULT_PATH_CONTROL_SIZE, DEFAULT_RPL_INSTANCE, ModeOfOperation,
};

pub const DEFAULT_ROOT_DODAG_ID: Ipv6Addr = Ipv6Addr::new(0x2002, 0x1, 0, 0, 0, 0, 0, 0);

/// One address assigned to a local interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub interface: u32,
    pub address: Ipv6Addr,
    pub prefix_length: u8,
}

impl InterfaceAddress {
    pub fn new(interface: u32, address: Ipv6Addr, prefix_length: u8) -> Self {
        InterfaceAddress {
            interface,
            address,
            prefix_length,
        }
    }

    pub fn is_link_local(&self) -> bool {
        self.address.is_unicast_link_local()
    }
}

/// Parameters a DODAG root starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootConfig {
    pub instance_id: u8,
    pub dodag_id: Ipv6Addr,
    pub version: u8,
}

impl Default for RootConfig {
    fn default() -> Self {
        RootConfig {
            instance_id: DEFAULT_RPL_INSTANCE,
            dodag_id: DEFAULT_ROOT_DODAG_ID,
            version: 1,
        }
    }
}

/// Configuration for an RPL node.
#[derive(Debug, Clone)]
pub struct RplConfig {
    pub i_min: Duration,
    pub i_max: Duration,
    pub redundancy_constant: u8,
    pub mode_of_operation: ModeOfOperation,
    pub objective: ObjectiveFunction,

    pub dis_interval: Duration,
    pub dao_delay: Duration,
    pub dao_ack_timeout: Duration,
    pub dao_max_retries: u8,
    pub disjoin_delay: Duration,
    pub max_rank_errors: u8,

    pub default_lifetime: u8,
    pub lifetime_unit: u16,
    pub min_hop_rank_increase: u16,

    pub root: Option<RootConfig>,
    pub rng_seed: Option<u64>,
}

impl Default for RplConfig {
    fn default() -> Self {
        let i_min = Duration::from_millis(1 << DEFAULT_DIO_INTERVAL_MIN);
        RplConfig {
            i_min,
            i_max: i_min * (1 << DEFAULT_DIO_INTERVAL_DOUBLINGS),
            redundancy_constant: DEFAULT_DIO_REDUNDANCY_CONSTANT,
            mode_of_operation: ModeOfOperation::NonStoring,
            objective: ObjectiveFunction::Of0,
            dis_interval: Duration::from_secs(1),
            dao_delay: Duration::from_secs(1),
            dao_ack_timeout: Duration::from_secs(5),
            dao_max_retries: 3,
            disjoin_delay: Duration::from_secs(5),
            max_rank_errors: 3,
            default_lifetime: DEFAULT_DEFAULT_LIFETIME,
            lifetime_unit: DEFAULT_LIFETIME_UNIT,
            min_hop_rank_increase: DEFAULT_MIN_HOP_RANK_INCREASE,
            root: None,
            rng_seed: None,
        }
    }
}

impl RplConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest Trickle interval.
    pub fn i_min(mut self, value: Duration) -> Self {
        self.i_min = value;
        self
    }

    /// Largest Trickle interval.
    pub fn i_max(mut self, value: Duration) -> Self {
        self.i_max = value;
        self
    }

    pub fn redundancy_constant(mut self, value: u8) -> Self {
        self.redundancy_constant = value;
        self
    }

    pub fn mode_of_operation(mut self, value: ModeOfOperation) -> Self {
        self.mode_of_operation = value;
        self
    }

    /// Shorthand for storing mode without multicast.
    pub fn storing(self) -> Self {
        self.mode_of_operation(ModeOfOperation::StoringWithoutMulticast)
    }

    pub fn objective(mut self, value: ObjectiveFunction) -> Self {
        self.objective = value;
        self
    }

    pub fn dis_interval(mut self, value: Duration) -> Self {
        self.dis_interval = value;
        self
    }

    pub fn dao_delay(mut self, value: Duration) -> Self {
        self.dao_delay = value;
        self
    }

    pub fn dao_ack_timeout(mut self, value: Duration) -> Self {
        self.dao_ack_timeout = value;
        self
    }

    pub fn dao_max_retries(mut self, value: u8) -> Self {
        self.dao_max_retries = value;
        self
    }

    pub fn disjoin_delay(mut self, value: Duration) -> Self {
        self.disjoin_delay = value;
        self
    }

    /// Loop detections tolerated before the instance halts.
    pub fn max_rank_errors(mut self, value: u8) -> Self {
        self.max_rank_errors = value;
        self
    }

    /// Advertised route lifetime, in `lifetime_unit` seconds.
    pub fn default_lifetime(mut self, value: u8) -> Self {
        self.default_lifetime = value;
        self
    }

    pub fn lifetime_unit(mut self, seconds: u16) -> Self {
        self.lifetime_unit = seconds;
        self
    }

    /// Rank step a root advertises; OF0 adds three of these per hop.
    pub fn min_hop_rank_increase(mut self, value: u16) -> Self {
        self.min_hop_rank_increase = value;
        self
    }

    /// Make this node a DODAG root.
    pub fn as_root(mut self, root: RootConfig) -> Self {
        self.root = Some(root);
        self
    }

    /// Seed Trickle's random draws for reproducible runs.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.i_min.is_zero() {
            return Err(RplError::InvalidConfig("i_min must be non-zero".into()));
        }
        if self.i_min > self.i_max {
            return Err(RplError::InvalidConfig(format!(
                "i_min {:?} exceeds i_max {:?}",
                self.i_min, self.i_max
            )));
        }
        if self.min_hop_rank_increase == 0 {
            return Err(RplError::InvalidConfig(
                "min_hop_rank_increase must be non-zero".into(),
            ));
        }
        if self.dao_max_retries == 0 {
            return Err(RplError::InvalidConfig(
                "dao_max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// DODAG Configuration option describing this node's parameters.
    pub fn dodag_configuration(&self) -> DodagConfiguration {
        let min_ms = self.i_min.as_millis().max(1);
        let doublings = (self.i_max.as_millis() / min_ms).max(1).ilog2();
        DodagConfiguration {
            authentication: false,
            path_control_size: DEFAULT_PATH_CONTROL_SIZE,
            dio_interval_doublings: doublings as u8,
            dio_interval_min: min_ms.ilog2() as u8,
            dio_redundancy_constant: self.redundancy_constant,
            max_rank_increase: 0,
            min_hop_rank_increase: self.min_hop_rank_increase,
            objective_code_point: self.objective.ocp(),
            default_lifetime: self.default_lifetime,
            lifetime_unit: self.lifetime_unit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = RplConfig::default();
        assert_eq!(config.i_min, Duration::from_millis(8));
        assert_eq!(config.i_max, Duration::from_millis(8 * 65536));
        assert_eq!(config.redundancy_constant, 10);
        assert_eq!(config.mode_of_operation, ModeOfOperation::NonStoring);
        assert!(!config.is_root());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn advertised_configuration_round_trips_exponents() {
        let conf = RplConfig::default().dodag_configuration();
        assert_eq!(conf, DodagConfiguration::default());

        let conf = RplConfig::new()
            .i_min(Duration::from_millis(1024))
            .i_max(Duration::from_millis(1024 << 5))
            .objective(ObjectiveFunction::HopCount)
            .dodag_configuration();
        assert_eq!(conf.dio_interval_min, 10);
        assert_eq!(conf.dio_interval_doublings, 5);
        assert_eq!(conf.objective_code_point, 1);
    }

    #[test]
    fn builder_chains() {
        let config = RplConfig::new()
            .storing()
            .redundancy_constant(0)
            .dao_max_retries(5)
            .rng_seed(42)
            .as_root(RootConfig::default());
        assert!(config.mode_of_operation.is_storing());
        assert_eq!(config.redundancy_constant, 0);
        assert_eq!(config.dao_max_retries, 5);
        assert_eq!(config.rng_seed, Some(42));
        assert_eq!(config.root.unwrap().dodag_id, "2002:1::".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn validate_rejects_bad_intervals() {
        assert!(RplConfig::new().i_min(Duration::ZERO).validate().is_err());
        assert!(
            RplConfig::new()
                .i_min(Duration::from_secs(2))
                .i_max(Duration::from_secs(1))
                .validate()
                .is_err()
        );
        assert!(RplConfig::new().dao_max_retries(0).validate().is_err());
    }

    #[test]
    fn min_hop_rank_increase_is_advertised() {
        let config = RplConfig::new().min_hop_rank_increase(128);
        assert!(config.validate().is_ok());
        assert_eq!(config.dodag_configuration().min_hop_rank_increase, 128);
        assert!(RplConfig::new().min_hop_rank_increase(0).validate().is_err());
    }

    #[test]
    fn link_local_detection() {
        assert!(InterfaceAddress::new(1, "fe80::1".parse().unwrap(), 64).is_link_local());
        assert!(!InterfaceAddress::new(1, "2001:1::1".parse().unwrap(), 64).is_link_local());
    }
}
