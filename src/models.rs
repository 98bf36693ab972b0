use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use crate::config::STALE_AFTER_HOURS;

/// A single priced instrument, e.g. one gold purity grade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRecord {
    #[serde(deserialize_with = "code_from_text_or_number")]
    pub code: String,
    pub label: String,
    pub price: u64,
}

impl RateRecord {
    pub fn new(code: impl Into<String>, label: impl Into<String>, price: u64) -> Self {
        Self {
            code: code.into(),
            label: label.into(),
            price,
        }
    }
}

// The purity endpoint has served codes both as "585" and as 585.
fn code_from_text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Code {
        Text(String),
        Number(i64),
    }

    Ok(match Code::deserialize(deserializer)? {
        Code::Text(text) => text,
        Code::Number(number) => number.to_string(),
    })
}

/// Builds the `code -> price` view used for change detection.
pub fn price_map(rates: &[RateRecord]) -> HashMap<&str, u64> {
    rates.iter().map(|r| (r.code.as_str(), r.price)).collect()
}

/// One captured rate set plus the instant it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub rates: Vec<RateRecord>,
    pub timestamp: DateTime<Utc>,
}

impl Generation {
    pub fn new(rates: Vec<RateRecord>, timestamp: DateTime<Utc>) -> Self {
        Self { rates, timestamp }
    }
}

/// What the board shows after a refresh: the current rates, the rates they
/// replaced, and when each set was captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub current: Vec<RateRecord>,
    pub previous: Vec<RateRecord>,
    pub last_updated: DateTime<Utc>,
    pub previous_updated: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn from_generations(current: &Generation, previous: Option<&Generation>) -> Self {
        Self {
            current: current.rates.clone(),
            previous: previous.map(|g| g.rates.clone()).unwrap_or_default(),
            last_updated: current.timestamp,
            previous_updated: previous.map(|g| g.timestamp),
        }
    }

    /// True once the current set is `STALE_AFTER_HOURS` old.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.last_updated >= Duration::hours(STALE_AFTER_HOURS)
    }

    /// Movement of one instrument's price against the previous generation.
    pub fn price_change(&self, code: &str) -> PriceChange {
        let current = self.current.iter().find(|r| r.code == code);
        let previous = self.previous.iter().find(|r| r.code == code);

        match (current, previous) {
            (Some(now), Some(before)) => PriceChange::between(before.price, now.price),
            _ => PriceChange::Unchanged,
        }
    }

    /// Current rates in board order: numeric codes descending (999 above
    /// 585), then any non-numeric codes alphabetically.
    pub fn board_order(&self) -> Vec<&RateRecord> {
        let mut rates: Vec<&RateRecord> = self.current.iter().collect();
        rates.sort_by(|a, b| {
            match (a.code.parse::<u64>().ok(), b.code.parse::<u64>().ok()) {
                (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.code.cmp(&b.code)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => a.code.cmp(&b.code),
            }
        });
        rates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "direction", content = "amount", rename_all = "lowercase")]
pub enum PriceChange {
    Up(u64),
    Down(u64),
    Unchanged,
}

impl PriceChange {
    pub fn between(before: u64, now: u64) -> Self {
        match now.cmp(&before) {
            Ordering::Greater => PriceChange::Up(now - before),
            Ordering::Less => PriceChange::Down(before - now),
            Ordering::Equal => PriceChange::Unchanged,
        }
    }
}

impl fmt::Display for PriceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceChange::Up(amount) => write!(f, "+{amount}"),
            PriceChange::Down(amount) => write!(f, "-{amount}"),
            PriceChange::Unchanged => write!(f, "="),
        }
    }
}

/// Physical digits of one kind that must be added to the flip-board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DigitWorkItem {
    pub digit: char,
    pub count: u32,
}

impl fmt::Display for DigitWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.digit, self.count)
    }
}
