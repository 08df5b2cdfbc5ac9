//! Energy price to operating band mapping.
//!
//! Bands are half-open price intervals `[min, max)` ordered by
//! `sort_order`. A price on a shared edge belongs to the band that starts
//! there. Prices no band covers (including NaN) fall back to the band with
//! the lowest `sort_order`; selection never fails on a non-empty table.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceType, Mode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct EnergyBand {
    pub name: String,
    pub sort_order: i32,
    /// Inclusive lower bound; unset means unbounded.
    #[serde(default)]
    pub min_price: Option<f64>,
    /// Exclusive upper bound; unset means unbounded.
    #[serde(default)]
    pub max_price: Option<f64>,
    /// Coin to mine while in this band. Used as the pool coin filter.
    #[serde(default)]
    pub target_coin: Option<String>,
    /// Operating mode to apply per hardware class.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub modes: BTreeMap<DeviceType, Mode>,
}

impl EnergyBand {
    pub fn contains(&self, price: f64) -> bool {
        // Comparisons against NaN are false, so NaN matches no bounded band.
        let above_min = self.min_price.is_none_or(|min| price >= min);
        let below_max = self.max_price.is_none_or(|max| price < max);
        above_min && below_max && !price.is_nan()
    }

    pub fn mode_for(&self, device_type: DeviceType) -> Option<&Mode> {
        self.modes.get(&device_type)
    }
}

/// Outcome of a band lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandSelection<'a> {
    pub band: &'a EnergyBand,
    /// No band covered the price; `band` is the lowest-ordered one.
    pub fallback: bool,
}

fn ordered(bands: &[EnergyBand]) -> Vec<&EnergyBand> {
    let mut ordered: Vec<_> = bands.iter().collect();
    ordered.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
    ordered
}

/// Pick the band for `price`. None only for an empty table.
pub fn select_band(bands: &[EnergyBand], price: f64) -> Option<BandSelection<'_>> {
    let ordered = ordered(bands);
    if let Some(band) = ordered.iter().find(|band| band.contains(price)) {
        return Some(BandSelection {
            band,
            fallback: false,
        });
    }
    ordered.first().map(|band| BandSelection {
        band,
        fallback: true,
    })
}

/// A structural problem in a band table. Reported, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum BandIssue {
    /// Prices in `[from, to)` are covered by no band.
    Gap { from: f64, to: f64 },
    /// Two adjacent bands both cover prices starting at `from`.
    Overlap { lower: String, upper: String, from: f64 },
    /// A band whose minimum is not below its maximum.
    Empty { band: String },
    /// Prices below the lowest bound have no band.
    UncoveredBelow { price: f64 },
    /// Prices at or above the highest bound have no band.
    UncoveredAbove { price: f64 },
}

impl fmt::Display for BandIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandIssue::Gap { from, to } => write!(f, "no band covers prices in [{from}, {to})"),
            BandIssue::Overlap { lower, upper, from } => {
                write!(f, "bands '{lower}' and '{upper}' overlap from {from}")
            }
            BandIssue::Empty { band } => write!(f, "band '{band}' covers no prices"),
            BandIssue::UncoveredBelow { price } => write!(f, "no band covers prices below {price}"),
            BandIssue::UncoveredAbove { price } => {
                write!(f, "no band covers prices at or above {price}")
            }
        }
    }
}

/// Check that the table, in price order, tiles the real line.
pub fn validate_bands(bands: &[EnergyBand]) -> Vec<BandIssue> {
    let mut issues = Vec::new();
    let mut by_price: Vec<&EnergyBand> = Vec::with_capacity(bands.len());

    for band in bands {
        if let (Some(min), Some(max)) = (band.min_price, band.max_price) {
            if min >= max {
                issues.push(BandIssue::Empty {
                    band: band.name.clone(),
                });
                continue;
            }
        }
        by_price.push(band);
    }

    by_price.sort_by(|a, b| match (a.min_price, b.min_price) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.total_cmp(&y),
    });

    let Some(first) = by_price.first() else {
        return issues;
    };
    if let Some(min) = first.min_price {
        issues.push(BandIssue::UncoveredBelow { price: min });
    }

    for pair in by_price.windows(2) {
        let (lower, upper) = (pair[0], pair[1]);
        let upper_min = upper.min_price.unwrap_or(f64::NEG_INFINITY);
        match lower.max_price {
            None => issues.push(BandIssue::Overlap {
                lower: lower.name.clone(),
                upper: upper.name.clone(),
                from: upper_min,
            }),
            Some(max) if max < upper_min => issues.push(BandIssue::Gap {
                from: max,
                to: upper_min,
            }),
            Some(max) if max > upper_min => issues.push(BandIssue::Overlap {
                lower: lower.name.clone(),
                upper: upper.name.clone(),
                from: upper_min,
            }),
            Some(_) => {}
        }
    }

    if let Some(max) = by_price.last().and_then(|band| band.max_price) {
        issues.push(BandIssue::UncoveredAbove { price: max });
    }

    issues
}
