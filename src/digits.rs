//! Digit reconciliation for the physical flip-board.
//!
//! The board has no "9" tiles: a "6" tile is mounted upside down instead, so
//! every '9' is counted as a '6'. This folding is a property of the hardware
//! and is not configurable.

use crate::models::{DigitWorkItem, RateRecord};

/// Tile faces the board stocks, in reporting order.
pub const BOARD_DIGITS: [char; 9] = ['0', '1', '2', '3', '4', '5', '6', '7', '8'];

fn fold(digit: u32) -> u32 {
    if digit == 9 {
        6
    } else {
        digit
    }
}

/// How many tiles of each face a rate set needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigitCounts([u32; BOARD_DIGITS.len()]);

impl DigitCounts {
    pub fn of(rates: &[RateRecord]) -> Self {
        let mut counts = Self::default();
        for rate in rates {
            // Anything that is not a decimal digit (a sign, say) is skipped.
            for digit in rate.price.to_string().chars().filter_map(|c| c.to_digit(10)) {
                counts.0[fold(digit) as usize] += 1;
            }
        }
        counts
    }

    pub fn get(&self, digit: char) -> u32 {
        digit
            .to_digit(10)
            .map(|d| self.0.get(fold(d) as usize).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, u32)> + '_ {
        BOARD_DIGITS.iter().copied().zip(self.0.iter().copied())
    }
}

/// Tiles to add so the board can show `current` after showing `previous`.
///
/// Digits whose count stayed the same or fell are omitted; spare tiles are
/// kept, not removed. Output is in ascending digit order.
pub fn reconcile(current: &[RateRecord], previous: &[RateRecord]) -> Vec<DigitWorkItem> {
    let now = DigitCounts::of(current);
    let before = DigitCounts::of(previous);

    now.iter()
        .zip(before.iter())
        .filter_map(|((digit, have), (_, had))| {
            have.checked_sub(had)
                .filter(|needed| *needed > 0)
                .map(|count| DigitWorkItem { digit, count })
        })
        .collect()
}
