use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// A rarity-bearing gift attribute (model, symbol or backdrop).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    /// Rarity in per-mille (‰) as reported upstream.
    pub rarity_per_mille: Decimal,
}

/// One completed marketplace purchase.
///
/// The `id` determines every other field: two fetches carrying the same `id`
/// are the same sale even if attribute text differs between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub id: String,
    pub gift_name: String,
    /// Upstream NFT identifier.
    pub gift_id: String,
    /// Collection serial number (`#1234`).
    pub gift_number: u64,
    pub floor_price: Option<Decimal>,
    pub sale_price: Decimal,
    pub model: Option<Attribute>,
    pub symbol: Option<Attribute>,
    pub backdrop: Option<Attribute>,
    pub sold_at: DateTime<Utc>,
}

/// Opaque pagination pointer into the upstream feed (numeric offset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub u32);

impl Cursor {
    /// Cursor pointing at the most recent page.
    pub fn start() -> Self {
        Self(0)
    }

    pub fn advance(self, entries: usize) -> Self {
        Self(self.0.saturating_add(entries as u32))
    }

    pub fn offset(self) -> u32 {
        self.0
    }
}

/// One page of the feed, newest first as served upstream.
#[derive(Debug, Clone, Default)]
pub struct SalesPage {
    pub sales: Vec<Sale>,
    /// Raw entry count including non-purchase actions.
    pub entries: usize,
    pub has_more: bool,
    pub next: Cursor,
}

// ── Wire format ────────────────────────────────────────────────────

/// `GET /api/market/actions/` response body.
#[derive(Debug, Deserialize)]
pub struct ActionsResponse {
    #[serde(default)]
    pub actions: Vec<RawAction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: Decimal,
    pub created_at: String,
    pub nft: RawNft,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawNft {
    pub id: String,
    pub name: String,
    #[serde(deserialize_with = "number_or_string")]
    pub external_collection_number: u64,
    #[serde(default)]
    pub floor_price: Option<Decimal>,
    #[serde(default)]
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAttribute {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub rarity_per_mille: Decimal,
}

impl RawAction {
    pub fn is_purchase(&self) -> bool {
        self.kind == "purchase"
    }

    /// Identifier of the sale: NFT id, raw timestamp and raw amount.
    pub fn sale_id(&self) -> String {
        format!("{}_{}_{}", self.nft.id, self.created_at, self.amount)
    }

    fn attribute(&self, kind: &str) -> Option<Attribute> {
        self.nft
            .attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| Attribute {
                name: a.value.clone(),
                rarity_per_mille: a.rarity_per_mille,
            })
    }
}

impl TryFrom<RawAction> for Sale {
    type Error = chrono::ParseError;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let sold_at = parse_timestamp(&raw.created_at)?;
        Ok(Sale {
            id: raw.sale_id(),
            model: raw.attribute("model"),
            symbol: raw.attribute("symbol"),
            backdrop: raw.attribute("backdrop"),
            gift_name: raw.nft.name,
            gift_id: raw.nft.id,
            gift_number: raw.nft.external_collection_number,
            floor_price: raw.nft.floor_price,
            sale_price: raw.amount,
            sold_at,
        })
    }
}

/// Parse an upstream timestamp. Offsets are honored; naive values are UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(e) => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| e),
    }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }

    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ── Reporting ──────────────────────────────────────────────────────

/// How a notification attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    /// Recorded as seen without sending (fresh-start backlog).
    Suppressed,
}

/// One JSON line per processed sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub timestamp: String,
    pub sale_id: String,
    pub gift_name: String,
    pub gift_number: u64,
    pub sale_price: Decimal,
    pub sold_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub pinned: bool,
}

/// Totals printed on shutdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub degraded_ticks: u64,
    pub pages_fetched: u64,
    pub sales_notified: u64,
    pub sales_suppressed: u64,
    pub delivery_failures: u64,
    pub credential_refreshes: u64,
    pub seen_ids: usize,
}
