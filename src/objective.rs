// src/objective.rs
//! Objective functions: how a node turns its parent's rank into its own.
//!
//! - OF0 (RFC 6552, OCP 0): fixed per-hop increment of
//!   `(RANK_FACTOR * STEP_OF_RANK + RANK_STRETCH) * MinHopRankIncrease`,
//!   where MinHopRankIncrease comes from the DODAG Configuration option
//! - Hop count (MRHOF with the hop-count metric, OCP 1): `metric + 1`

pub const OCP_OF0: u16 = 0;
pub const OCP_MRHOF: u16 = 1;

const RANK_FACTOR: u16 = 1;
const STEP_OF_RANK: u16 = 3;
const RANK_STRETCH: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectiveFunction {
    Of0,
    HopCount,
}

impl ObjectiveFunction {
    /// Pick the objective function named by a DODAG's objective code point.
    pub fn from_ocp(ocp: u16) -> Option<Self> {
        match ocp {
            OCP_OF0 => Some(ObjectiveFunction::Of0),
            OCP_MRHOF => Some(ObjectiveFunction::HopCount),
            _ => None,
        }
    }

    pub fn ocp(self) -> u16 {
        match self {
            ObjectiveFunction::Of0 => OCP_OF0,
            ObjectiveFunction::HopCount => OCP_MRHOF,
        }
    }

    /// Rank of the DODAG root. Never computed.
    pub fn root_rank(self) -> u16 {
        match self {
            ObjectiveFunction::Of0 => 1,
            ObjectiveFunction::HopCount => 0,
        }
    }

    /// Rank added per hop in a DODAG advertising `min_hop_rank_increase`.
    pub fn rank_increase(self, min_hop_rank_increase: u16) -> u16 {
        match self {
            ObjectiveFunction::Of0 => {
                (RANK_FACTOR * STEP_OF_RANK + RANK_STRETCH).saturating_mul(min_hop_rank_increase)
            }
            ObjectiveFunction::HopCount => 1,
        }
    }

    /// Rank of a node whose parent advertises `parent_rank` (or, for the
    /// hop-count function, the path metric). Saturates at infinite rank.
    pub fn compute_rank(self, parent_rank: u16, min_hop_rank_increase: u16) -> u16 {
        parent_rank.saturating_add(self.rank_increase(min_hop_rank_increase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DEFAULT_MIN_HOP_RANK_INCREASE, INFINITE_RANK};

    const MHRI: u16 = DEFAULT_MIN_HOP_RANK_INCREASE;

    #[test]
    fn of0_adds_768_per_hop() {
        let of = ObjectiveFunction::Of0;
        assert_eq!(of.rank_increase(MHRI), 768);
        assert_eq!(of.compute_rank(of.root_rank(), MHRI), 769);
        assert_eq!(of.compute_rank(769, MHRI), 1537);
    }

    #[test]
    fn of0_scales_with_min_hop_rank_increase() {
        let of = ObjectiveFunction::Of0;
        assert_eq!(of.rank_increase(128), 384);
        assert_eq!(of.compute_rank(of.root_rank(), 128), 385);
        assert_eq!(of.rank_increase(u16::MAX), u16::MAX);
    }

    #[test]
    fn hop_count_adds_one() {
        let of = ObjectiveFunction::HopCount;
        assert_eq!(of.root_rank(), 0);
        assert_eq!(of.compute_rank(0, MHRI), 1);
        assert_eq!(of.compute_rank(4, 128), 5);
    }

    #[test]
    fn rank_saturates_at_infinite() {
        assert_eq!(ObjectiveFunction::Of0.compute_rank(0xff00, MHRI), INFINITE_RANK);
        assert_eq!(
            ObjectiveFunction::HopCount.compute_rank(INFINITE_RANK, MHRI),
            INFINITE_RANK
        );
    }

    #[test]
    fn selected_by_code_point() {
        assert_eq!(ObjectiveFunction::from_ocp(0), Some(ObjectiveFunction::Of0));
        assert_eq!(
            ObjectiveFunction::from_ocp(1),
            Some(ObjectiveFunction::HopCount)
        );
        assert_eq!(ObjectiveFunction::from_ocp(7), None);
        assert_eq!(ObjectiveFunction::HopCount.ocp(), 1);
    }
}
