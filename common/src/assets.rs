//! Tracked assets.
//!
//! The platform observes BTC and ETH perpetuals only; every keyed table and
//! in-memory map uses this enum rather than free-form strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stop fraction bounds applied when converting ATR to a per-asset stop
/// fraction (spec: R denominator must stay within [0.1%, 10%] of entry).
pub const STOP_FRACTION_MIN: f64 = 0.001;
pub const STOP_FRACTION_MAX: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
}

impl Asset {
    pub const ALL: [Asset; 2] = [Asset::Btc, Asset::Eth];

    /// Canonical symbol used in the DB and on the bus.
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
        }
    }

    /// Coin name on the Hyperliquid info API.
    pub fn hl_coin(&self) -> &'static str {
        self.as_str()
    }

    /// Clamp an ATR-derived stop fraction into the allowed band.
    pub fn clamp_stop_fraction(fraction: f64) -> f64 {
        fraction.clamp(STOP_FRACTION_MIN, STOP_FRACTION_MAX)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            other => Err(format!("unknown asset: {other}")),
        }
    }
}

/// Trade direction for an episode or a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// Sign convention: long = +1, short = -1.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn from_signed_size(size: f64) -> Direction {
        if size >= 0.0 {
            Direction::Long
        } else {
            Direction::Short
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_round_trips() {
        for asset in Asset::ALL {
            assert_eq!(asset.as_str().parse::<Asset>().unwrap(), asset);
        }
        assert!("DOGE".parse::<Asset>().is_err());
    }

    #[test]
    fn stop_fraction_clamps() {
        assert_eq!(Asset::clamp_stop_fraction(0.0), STOP_FRACTION_MIN);
        assert_eq!(Asset::clamp_stop_fraction(0.5), STOP_FRACTION_MAX);
        assert_eq!(Asset::clamp_stop_fraction(0.01), 0.01);
    }

    #[test]
    fn direction_signs() {
        assert_eq!(Direction::Long.sign(), 1.0);
        assert_eq!(Direction::Short.sign(), -1.0);
        assert_eq!(Direction::from_signed_size(-2.5), Direction::Short);
        assert_eq!(Direction::Long.opposite(), Direction::Short);
    }
}
