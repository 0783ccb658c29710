//! Record types stored field-per-key in the service stores.
//!
//! Key layout is bit-stable: `model:<id>:<field>`, plus the snapshot
//! bookkeeping records named by the constants below.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::kv::record::{CodecError, FieldCodec, FieldMap, Record};

/// Stream carrying `{tid}` events between the saga legs and the vibe checker.
pub const TRANSACTIONS_STREAM: &str = "transactions";
/// Consumer group name; one group per service, one consumer per replica.
pub const TRANSACTION_CONSUMER_GROUP: &str = "transaction_consumer_group";

/// Flag record that pauses new checkouts and stream consumption.
pub const HALTED_FLAG: &str = "HALTED";
/// Counter record the consumers bump when they park for a snapshot.
pub const HALTED_CONSUMERS_COUNTER: &str = "halted_consumers_counter";
/// Counter record tracking PENDING observations in the reconciliation loop.
pub const PENDING_COUNTER: &str = "pending_count";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub credit: i64,
    /// Funds debited by SUCCESS legs the saga has not yet finalized.
    pub committed_credit: i64,
}

impl User {
    pub fn new(id: impl Into<String>, credit: i64) -> Self {
        Self {
            id: id.into(),
            credit,
            committed_credit: 0,
        }
    }
}

impl Record for User {
    const FIELDS: &'static [&'static str] = &["credit", "committed_credit"];

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("credit", self.credit.encode()),
            ("committed_credit", self.committed_credit.encode()),
        ]
    }

    fn from_fields(id: &str, fields: &FieldMap) -> Result<Self, CodecError> {
        Ok(Self {
            id: id.to_string(),
            credit: fields.required("credit")?,
            committed_credit: fields.or_default("committed_credit")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub stock: i64,
    pub price: i64,
    /// Inventory counterpart of `User::committed_credit`.
    pub committed_stock: i64,
}

impl Item {
    pub fn new(id: impl Into<String>, stock: i64, price: i64) -> Self {
        Self {
            id: id.into(),
            stock,
            price,
            committed_stock: 0,
        }
    }
}

impl Record for Item {
    const FIELDS: &'static [&'static str] = &["stock", "price", "committed_stock"];

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("stock", self.stock.encode()),
            ("price", self.price.encode()),
            ("committed_stock", self.committed_stock.encode()),
        ]
    }

    fn from_fields(id: &str, fields: &FieldMap) -> Result<Self, CodecError> {
        Ok(Self {
            id: id.to_string(),
            stock: fields.required("stock")?,
            price: fields.required("price")?,
            committed_stock: fields.or_default("committed_stock")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: String,
    /// Number of successful checkouts, not a boolean. Idempotent commits
    /// increment it; finders compare against zero.
    pub paid: i64,
    /// Lines encoded as `"item_id:qty"`.
    pub items: Vec<String>,
    pub user_id: String,
    pub total_cost: i64,
}

impl Order {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            paid: 0,
            items: Vec::new(),
            user_id: user_id.into(),
            total_cost: 0,
        }
    }

    /// Encode one order line.
    pub fn line(item_id: &str, quantity: i64) -> String {
        format!("{item_id}:{quantity}")
    }

    /// Decode one order line. `None` on a malformed entry.
    pub fn parse_line(line: &str) -> Option<(&str, i64)> {
        let (item_id, qty) = line.rsplit_once(':')?;
        let qty: i64 = qty.parse().ok()?;
        Some((item_id, qty))
    }

    /// Aggregate the lines into per-item quantities, the shape the stock
    /// fan-out wants. Malformed lines are skipped.
    pub fn aggregated_items(&self) -> BTreeMap<String, i64> {
        let mut totals = BTreeMap::new();
        for line in &self.items {
            if let Some((item_id, qty)) = Self::parse_line(line) {
                *totals.entry(item_id.to_string()).or_insert(0) += qty;
            }
        }
        totals
    }
}

impl Record for Order {
    const FIELDS: &'static [&'static str] = &["paid", "items", "user_id", "total_cost"];

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("paid", self.paid.encode()),
            ("items", self.items.encode()),
            ("user_id", self.user_id.encode()),
            ("total_cost", self.total_cost.encode()),
        ]
    }

    fn from_fields(id: &str, fields: &FieldMap) -> Result<Self, CodecError> {
        Ok(Self {
            id: id.to_string(),
            paid: fields.required("paid")?,
            items: fields.or_default("items")?,
            user_id: fields.required("user_id")?,
            total_cost: fields.or_default("total_cost")?,
        })
    }
}

/// Saga leg status. The numeric codes are written directly by the Lua
/// scripts and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Failure,
    Success,
    Stale,
}

impl TransactionStatus {
    pub fn code(self) -> i64 {
        match self {
            TransactionStatus::Pending => 0,
            TransactionStatus::Failure => 1,
            TransactionStatus::Success => 2,
            TransactionStatus::Stale => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TransactionStatus::Pending),
            1 => Some(TransactionStatus::Failure),
            2 => Some(TransactionStatus::Success),
            3 => Some(TransactionStatus::Stale),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Failure => "FAILURE",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Stale => "STALE",
        }
    }
}

impl FieldCodec for TransactionStatus {
    const KIND: &'static str = "transaction status";

    fn encode(&self) -> String {
        self.code().to_string()
    }

    fn decode(raw: &str) -> Option<Self> {
        let code: i64 = raw.trim().parse().ok()?;
        Self::from_code(code)
    }
}

/// Ground truth of one saga leg. Written before the conditional decrement so
/// the stream event and the peer's vibe check always find it; the decrement
/// script flips `status` atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: String,
    pub status: TransactionStatus,
    /// Per-key deltas this leg applied (user or item id -> amount), used for
    /// compensation.
    pub details: BTreeMap<String, i64>,
    pub created_at: i64,
    /// Advisory lock, transferred via compare-and-set.
    pub locked: bool,
}

impl Transaction {
    pub fn pending(tid: impl Into<String>, details: BTreeMap<String, i64>) -> Self {
        Self {
            id: tid.into(),
            status: TransactionStatus::Pending,
            details,
            created_at: Utc::now().timestamp(),
            locked: false,
        }
    }

    /// Terminal marker written when a peer's lookup retries exhaust, so a
    /// late arrival of the creator's write gets rejected.
    pub fn stale(tid: impl Into<String>) -> Self {
        Self {
            id: tid.into(),
            status: TransactionStatus::Stale,
            details: BTreeMap::new(),
            created_at: Utc::now().timestamp(),
            locked: false,
        }
    }
}

impl Record for Transaction {
    const FIELDS: &'static [&'static str] = &["status", "details", "created_at", "locked"];

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("status", self.status.encode()),
            ("details", self.details.encode()),
            ("created_at", self.created_at.encode()),
            ("locked", self.locked.encode()),
        ]
    }

    fn from_fields(id: &str, fields: &FieldMap) -> Result<Self, CodecError> {
        Ok(Self {
            id: id.to_string(),
            status: fields.required("status")?,
            details: fields.or_default("details")?,
            created_at: fields.or_default("created_at")?,
            locked: fields.or_default("locked")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub id: String,
    pub count: i64,
}

impl Record for Counter {
    const FIELDS: &'static [&'static str] = &["count"];

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![("count", self.count.encode())]
    }

    fn from_fields(id: &str, fields: &FieldMap) -> Result<Self, CodecError> {
        Ok(Self {
            id: id.to_string(),
            count: fields.required("count")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub id: String,
    pub enabled: bool,
}

impl Record for Flag {
    const FIELDS: &'static [&'static str] = &["enabled"];

    fn id(&self) -> &str {
        &self.id
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![("enabled", self.enabled.encode())]
    }

    fn from_fields(id: &str, fields: &FieldMap) -> Result<Self, CodecError> {
        Ok(Self {
            id: id.to_string(),
            enabled: fields.required("enabled")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_scripts() {
        // The Lua scripts write 1 for FAILURE and 2 for SUCCESS.
        assert_eq!(TransactionStatus::Failure.code(), 1);
        assert_eq!(TransactionStatus::Success.code(), 2);
        assert_eq!(TransactionStatus::from_code(0), Some(TransactionStatus::Pending));
        assert_eq!(TransactionStatus::from_code(3), Some(TransactionStatus::Stale));
        assert_eq!(TransactionStatus::from_code(4), None);
    }

    #[test]
    fn test_status_codec() {
        assert_eq!(TransactionStatus::Success.encode(), "2");
        assert_eq!(
            TransactionStatus::decode("1"),
            Some(TransactionStatus::Failure)
        );
        assert_eq!(TransactionStatus::decode("nope"), None);
    }

    #[test]
    fn test_order_line_roundtrip() {
        let line = Order::line("item-7", 3);
        assert_eq!(line, "item-7:3");
        assert_eq!(Order::parse_line(&line), Some(("item-7", 3)));
        assert_eq!(Order::parse_line("garbage"), None);
    }

    #[test]
    fn test_order_aggregates_duplicate_items() {
        let mut order = Order::new("o1", "u1");
        order.items = vec![
            Order::line("a", 1),
            Order::line("b", 2),
            Order::line("a", 4),
        ];
        let totals = order.aggregated_items();
        assert_eq!(totals.get("a"), Some(&5));
        assert_eq!(totals.get("b"), Some(&2));
    }

    #[test]
    fn test_user_record_roundtrip() {
        let user = User::new("u1", 100);
        let mut fields = FieldMap::new();
        for (name, raw) in user.to_fields() {
            fields.insert(name, raw);
        }
        let back = User::from_fields("u1", &fields).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn test_transaction_defaults_apply() {
        // A record reduced to its status key still decodes; everything else
        // falls back to defaults.
        let mut fields = FieldMap::new();
        fields.insert("status", "2".to_string());
        let txn = Transaction::from_fields("tid-1", &fields).unwrap();
        assert_eq!(txn.status, TransactionStatus::Success);
        assert!(txn.details.is_empty());
        assert!(!txn.locked);
    }

    #[test]
    fn test_order_record_missing_required_field() {
        let mut fields = FieldMap::new();
        fields.insert("paid", "0".to_string());
        assert!(matches!(
            Order::from_fields("o1", &fields),
            Err(CodecError::Missing("user_id"))
        ));
    }
}
