//! Describing distributions of mining power

use std::collections::HashSet;

use serde::Deserialize;

use crate::peer::PeerId;

/// Numeric type used to represent mining power.
pub type PowerValue = f64;

/// Hashing weight of a high-CPU peer relative to a low-CPU peer.
pub const HIGH_CPU_WEIGHT: PowerValue = 10.0;

/// Hashing weight of a low-CPU peer.
pub const LOW_CPU_WEIGHT: PowerValue = 1.0;

/// Determines how mining power is distributed between peers during a
/// simulation.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerDistribution {
    /// Distribute power in proportion to each peer's CPU weight.
    #[default]
    Proportional,
    /// Fix the power of the listed peers to values between `0.0` and `1.0`
    /// inclusive. The remaining power is distributed between all other
    /// peers in proportion to their CPU weight.
    SetPeers(Vec<(PeerId, PowerValue)>),
    /// Set all mining power values to those in the given vector.
    SetValues(Vec<PowerValue>),
}

#[derive(Debug, thiserror::Error)]
pub enum PowerDistributionError {
    #[error("distribution values sum to {0}, not 1.0")]
    BadDistributionSum(PowerValue),
    #[error("power value {0} is not in the range 0.0..=1.0")]
    BadPowerValue(PowerValue),
    #[error("cannot set power for {0}, which is not part of the network")]
    SetPeerBadPeerId(PeerId),
    #[error("power of {0} is set more than once")]
    SetPeerTwice(PeerId),
    #[error("power distribution size {0} does not match peer count {1}")]
    WrongNumPeers(usize, usize),
    #[error("cannot create a distribution for zero peers")]
    ZeroPeersGiven,
}

impl PowerDistribution {
    /// Allowable difference between a distribution sum and 1.0.
    const EPSILON_POWER: PowerValue = 1e-6;

    /// Returns true if the discrete distribution described by this
    /// [`PowerDistribution`] is valid over `num_peers`.
    #[inline]
    pub fn is_valid(&self, num_peers: usize) -> bool {
        self.validate(num_peers).is_ok()
    }

    /// Checks if the discrete distribution described by this
    /// [`PowerDistribution`] is valid over `num_peers`.
    pub fn validate(
        &self,
        num_peers: usize,
    ) -> Result<(), PowerDistributionError> {
        use PowerDistributionError::*;

        if num_peers == 0 {
            return Err(ZeroPeersGiven);
        }

        match &self {
            Self::Proportional => Ok(()),
            Self::SetValues(dist) => {
                if dist.len() != num_peers {
                    return Err(WrongNumPeers(dist.len(), num_peers));
                }

                if let Some(&val) = dist.iter().find(|&&x| !is_power_value(x)) {
                    return Err(BadPowerValue(val));
                }

                let sum = dist.iter().sum();
                if PowerValue::abs(sum - 1.0) > Self::EPSILON_POWER {
                    return Err(BadDistributionSum(sum));
                }

                Ok(())
            }
            Self::SetPeers(fixed) => {
                let mut seen = HashSet::new();
                for &(peer, power) in fixed {
                    if peer.get() >= num_peers {
                        return Err(SetPeerBadPeerId(peer));
                    }
                    if !seen.insert(peer) {
                        return Err(SetPeerTwice(peer));
                    }
                    if !is_power_value(power) {
                        return Err(BadPowerValue(power));
                    }
                }

                let sum: PowerValue =
                    fixed.iter().map(|(_, power)| power).sum();
                let everyone_set = seen.len() == num_peers;
                if sum > 1.0 + Self::EPSILON_POWER
                    || (everyone_set && (sum - 1.0).abs() > Self::EPSILON_POWER)
                {
                    return Err(BadDistributionSum(sum));
                }

                Ok(())
            }
        }
    }

    /// Returns the power of `peer` according to this power distribution,
    /// where `cpu_weights` holds the hashing weight of every peer.
    pub fn power_of(
        &self,
        peer: PeerId,
        cpu_weights: &[PowerValue],
    ) -> Result<PowerValue, PowerDistributionError> {
        let values = self.values(cpu_weights)?;

        values
            .get(peer.get())
            .copied()
            .ok_or(PowerDistributionError::SetPeerBadPeerId(peer))
    }

    /// Returns the power values described by this power distribution as a
    /// vector indexed by [`PeerId`]. `cpu_weights` holds the hashing weight
    /// of every peer. Returns a [`PowerDistributionError`] if the underlying
    /// distribution is invalid over `cpu_weights.len()` peers.
    pub fn values(
        &self,
        cpu_weights: &[PowerValue],
    ) -> Result<Vec<PowerValue>, PowerDistributionError> {
        self.validate(cpu_weights.len())?;

        let values = match &self {
            Self::Proportional => proportional(cpu_weights, 1.0),
            Self::SetValues(dist) => dist.clone(),
            Self::SetPeers(fixed) => {
                let fixed_sum: PowerValue =
                    fixed.iter().map(|(_, power)| power).sum();

                let mut weights = cpu_weights.to_vec();
                for (peer, _) in fixed {
                    weights[peer.get()] = 0.0;
                }

                let mut dist = proportional(&weights, 1.0 - fixed_sum);
                for &(peer, power) in fixed {
                    dist[peer.get()] = power;
                }

                dist
            }
        };

        Ok(values)
    }
}

#[inline]
fn is_power_value(x: PowerValue) -> bool {
    !x.is_nan() && (0.0..=1.0).contains(&x)
}

/// Splits `total` between entries in proportion to `weights`.
fn proportional(weights: &[PowerValue], total: PowerValue) -> Vec<PowerValue> {
    let sum: PowerValue = weights.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; weights.len()];
    }

    weights.iter().map(|w| total.max(0.0) * w / sum).collect()
}

/// Helper trait for turning inclusive integer ranges into percentages.
/// # Example
/// ```
/// use pow_network_sim::power_dist::Percent;
///
/// for p in (0..=10).percent() {
///    println!("{}", p);
/// }
/// ```
pub trait Percent {
    /// Returns an iterator over percentage values. Can be used with
    /// [`SimulationBuilder`](crate::simulation::SimulationBuilder) to describe
    /// distributions of mining power.
    fn percent(self) -> impl Iterator<Item = PowerValue>;
}

impl Percent for std::ops::RangeInclusive<usize> {
    fn percent(self) -> impl Iterator<Item = PowerValue> {
        assert!(
            (0..=100).contains(self.start()) && (0..=100).contains(self.end()),
            "invalid percent range {} to {}",
            self.start(),
            self.end()
        );

        self.map(|n| n as PowerValue / 100.0)
    }
}
