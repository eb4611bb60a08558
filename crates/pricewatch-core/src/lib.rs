//! Core domain model for pricewatch: product snapshots, tracked entities and traces.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pricewatch-core";

/// Prices are integer amounts of the minor currency unit (cents, grosze).
pub type MinorUnits = i64;

/// Identifier assigned by the retailer. Feeds emit both numeric and string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawExternalId", into = "String")]
pub struct ExternalId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExternalId {
    Text(String),
    Number(i64),
}

impl From<RawExternalId> for ExternalId {
    fn from(raw: RawExternalId) -> Self {
        match raw {
            RawExternalId::Text(text) => Self(text.trim().to_string()),
            RawExternalId::Number(n) => Self(n.to_string()),
        }
    }
}

impl From<ExternalId> for String {
    fn from(id: ExternalId) -> Self {
        id.0
    }
}

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One cycle's observation of a product, as handed over by the crawl layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    #[serde(default, alias = "id")]
    pub external_id: Option<ExternalId>,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub colors: Vec<ColorSnapshot>,
    /// Overrides the ingestion clock when present (back-fills, replays).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl ProductSnapshot {
    pub fn defaults(&self) -> ProductDefaults {
        ProductDefaults {
            market: self.market.clone(),
            name: self.name.clone(),
            category: self.category.clone(),
            description: self.description.clone(),
            url: self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorSnapshot {
    #[serde(default, alias = "id")]
    pub external_id: Option<ExternalId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub price: Option<MinorUnits>,
    #[serde(default, alias = "old_price")]
    pub old_price: Option<MinorUnits>,
    #[serde(default, alias = "original_price")]
    pub original_price: Option<MinorUnits>,
    #[serde(default)]
    pub sizes: Vec<SizeSnapshot>,
}

impl ColorSnapshot {
    pub fn defaults(&self) -> ColorDefaults {
        ColorDefaults {
            name: self.name.clone(),
            images: self.images.clone(),
        }
    }

    /// `None` when the listing carried no current price.
    pub fn price_fields(&self) -> Option<PriceFields> {
        self.price.map(|price| PriceFields {
            price,
            old_price: self.old_price,
            original_price: self.original_price,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeSnapshot {
    #[serde(default, alias = "id")]
    pub external_id: Option<ExternalId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub availability: Option<Availability>,
    #[serde(default)]
    pub price: Option<MinorUnits>,
    #[serde(default, alias = "old_price")]
    pub old_price: Option<MinorUnits>,
    #[serde(default, alias = "original_price")]
    pub original_price: Option<MinorUnits>,
}

impl SizeSnapshot {
    pub fn defaults(&self) -> SizeDefaults {
        SizeDefaults {
            name: self.name.clone(),
        }
    }

    pub fn price_fields(&self) -> Option<PriceFields> {
        self.price.map(|price| PriceFields {
            price,
            old_price: self.old_price,
            original_price: self.original_price,
        })
    }
}

/// Values used only when the product row is created; first-seen values win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductDefaults {
    pub market: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorDefaults {
    pub name: String,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeDefaults {
    pub name: String,
}

/// The three price columns tracked together as one observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceFields {
    pub price: MinorUnits,
    pub old_price: Option<MinorUnits>,
    pub original_price: Option<MinorUnits>,
}

impl PriceFields {
    pub fn new(price: MinorUnits) -> Self {
        Self {
            price,
            old_price: None,
            original_price: None,
        }
    }

    /// True when a new trace must be appended on top of `latest`.
    /// Absent vs present counts as a difference; two absents are equal.
    pub fn differs_from(&self, latest: Option<&PriceTrace>) -> bool {
        match latest {
            None => true,
            Some(trace) => *self != trace.fields(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Availability(pub String);

impl Availability {
    pub fn new(state: impl Into<String>) -> Self {
        Self(state.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn differs_from(&self, latest: Option<&AvailabilityTrace>) -> bool {
        latest.map_or(true, |trace| trace.availability != *self)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! row_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(ProductId);
row_id!(ColorId);
row_id!(SizeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Product,
    Color,
    Size,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Product => "product",
            Self::Color => "color",
            Self::Size => "size",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub external_id: String,
    pub market: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub id: ColorId,
    pub product_id: ProductId,
    pub external_id: String,
    pub name: String,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub id: SizeId,
    pub color_id: ColorId,
    pub external_id: String,
    pub name: String,
}

/// Entity a price trace belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TraceOwner {
    Color(ColorId),
    Size(SizeId),
}

impl TraceOwner {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Color(_) => "color",
            Self::Size(_) => "size",
        }
    }

    pub fn row_id(&self) -> i64 {
        match self {
            Self::Color(id) => id.0,
            Self::Size(id) => id.0,
        }
    }
}

impl fmt::Display for TraceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.row_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTrace {
    pub id: i64,
    pub owner: TraceOwner,
    pub price: MinorUnits,
    pub old_price: Option<MinorUnits>,
    pub original_price: Option<MinorUnits>,
    pub created_at: DateTime<Utc>,
}

impl PriceTrace {
    pub fn fields(&self) -> PriceFields {
        PriceFields {
            price: self.price,
            old_price: self.old_price,
            original_price: self.original_price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityTrace {
    pub id: i64,
    pub size_id: SizeId,
    pub availability: Availability,
    pub created_at: DateTime<Utc>,
}

/// What the messaging collaborator receives for one flagged product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub market: String,
    pub images: Vec<String>,
    pub text: String,
}

/// Renders minor units as a major-unit amount with two decimals (`1999` -> `19.99`).
pub fn format_minor_units(amount: MinorUnits) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Fixed UTC offset used to bucket traces into calendar days.
///
/// One offset applies to the whole system; it is recorded by the store on first
/// open and never taken from the host's ambient zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBucket {
    offset: FixedOffset,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OffsetParseError {
    #[error("utc offset must look like +HH:MM or -HH:MM, got {0:?}")]
    Format(String),
    #[error("utc offset out of range: {0:?}")]
    Range(String),
}

impl DayBucket {
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    pub fn from_offset(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn today(&self) -> NaiveDate {
        self.date_of(Utc::now())
    }

    /// Canonical `+HH:MM` form, also used as the persisted marker.
    pub fn label(&self) -> String {
        let secs = self.offset.local_minus_utc();
        let sign = if secs < 0 { '-' } else { '+' };
        let mins = secs.unsigned_abs() / 60;
        format!("{sign}{:02}:{:02}", mins / 60, mins % 60)
    }
}

impl Default for DayBucket {
    fn default() -> Self {
        Self::utc()
    }
}

impl FromStr for DayBucket {
    type Err = OffsetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Ok(Self::utc());
        }
        let (sign, rest) = match s.chars().next() {
            Some('+') => (1, &s[1..]),
            Some('-') => (-1, &s[1..]),
            _ => return Err(OffsetParseError::Format(s.to_string())),
        };
        let (hours, minutes) = rest
            .split_once(':')
            .ok_or_else(|| OffsetParseError::Format(s.to_string()))?;
        let hours: i32 = hours
            .parse()
            .map_err(|_| OffsetParseError::Format(s.to_string()))?;
        let minutes: i32 = minutes
            .parse()
            .map_err(|_| OffsetParseError::Format(s.to_string()))?;
        if hours < 0 || !(0..60).contains(&minutes) {
            return Err(OffsetParseError::Range(s.to_string()));
        }
        let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .ok_or_else(|| OffsetParseError::Range(s.to_string()))?;
        Ok(Self { offset })
    }
}

impl fmt::Display for DayBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
