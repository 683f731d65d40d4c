use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// key: billing-tenant -> school identifier scoping every ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct SchoolId(pub Uuid);

impl fmt::Display for SchoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Amount in minor currency units (cents). Never a float.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn negate(self) -> Money {
        Money(-self.0)
    }

    /// Parses a decimal display string (`"40"`, `"40.5"`, `"40.50"`) at the HTTP boundary.
    pub fn parse_decimal(raw: &str) -> Option<Money> {
        let raw = raw.trim();
        let (negative, digits) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (whole, fraction) = match digits.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (digits, ""),
        };
        if whole.is_empty() || fraction.len() > 2 {
            return None;
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return None;
        }
        let whole: i64 = whole.parse().ok()?;
        let cents: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().ok()? * 10,
            _ => fraction.parse().ok()?,
        };
        let minor = whole.checked_mul(100)?.checked_add(cents)?;
        Some(Money(if negative { -minor } else { minor }))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, other: Money) {
        self.0 += other.0;
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, other: Money) -> Money {
        Money(self.0 - other.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        Money(iter.map(|m| m.0).sum())
    }
}

/// key: billing-period -> month/year key of a tuition invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub month: u32,
    pub year: i32,
}

impl BillingPeriod {
    pub fn new(month: u32, year: i32) -> AppResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(AppError::Validation {
                message: format!("billing month {month} is outside 1..=12"),
                offending: vec!["month".to_string()],
            });
        }
        Ok(Self { month, year })
    }

    /// Generation is only allowed from last year up to next year.
    pub fn validate_for_generation(&self, today: NaiveDate) -> AppResult<()> {
        let current = today.year();
        if self.year < current - 1 || self.year > current + 1 {
            return Err(AppError::Validation {
                message: format!(
                    "billing year {} is outside the accepted window {}..={}",
                    self.year,
                    current - 1,
                    current + 1
                ),
                offending: vec!["year".to_string()],
            });
        }
        Ok(())
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            year: date.year(),
        }
    }

    pub fn start(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// First day of the following period (exclusive bound).
    pub fn end(&self) -> NaiveDate {
        let (year, month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX)
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.start().and_time(NaiveTime::MIN))
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.end().and_time(NaiveTime::MIN))
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Suspended,
    Withdrawn,
}

/// Reference to a student owned by the enrollment system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentRef {
    pub id: Uuid,
    pub guardian_name: String,
    pub enrollment_status: EnrollmentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(InvoiceStatus::Pending),
            "paid" => Some(InvoiceStatus::Paid),
            "overdue" => Some(InvoiceStatus::Overdue),
            "cancelled" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }

    /// Status an unpaid invoice should carry on `today`.
    pub fn unpaid_on(due_date: NaiveDate, today: NaiveDate) -> Self {
        if due_date < today {
            InvoiceStatus::Overdue
        } else {
            InvoiceStatus::Pending
        }
    }
}

/// key: billing-invoice-model -> one per student per period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub school_id: SchoolId,
    pub student_id: Uuid,
    pub amount: Money,
    pub due_date: NaiveDate,
    pub billing_month: i32,
    pub billing_year: i32,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn period(&self) -> BillingPeriod {
        BillingPeriod {
            month: self.billing_month as u32,
            year: self.billing_year,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    InstantTransfer,
    CreditCard,
    DebitCard,
    BankSlip,
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::InstantTransfer => "instant_transfer",
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::DebitCard => "debit_card",
            PaymentMethod::BankSlip => "bank_slip",
            PaymentMethod::Cash => "cash",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "instant_transfer" => Some(PaymentMethod::InstantTransfer),
            "credit_card" => Some(PaymentMethod::CreditCard),
            "debit_card" => Some(PaymentMethod::DebitCard),
            "bank_slip" => Some(PaymentMethod::BankSlip),
            "cash" => Some(PaymentMethod::Cash),
            _ => None,
        }
    }
}

/// key: billing-payment-model -> immutable once written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub school_id: SchoolId,
    pub invoice_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub amount: Money,
    pub method: PaymentMethod,
    pub paid_at: DateTime<Utc>,
    pub recorded_by: String,
    pub reverses_payment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    AwaitingPayment,
    Paid,
    Expired,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::AwaitingPayment => "awaiting_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::Expired => "expired",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(OrderStatus::Created),
            "awaiting_payment" => Some(OrderStatus::AwaitingPayment),
            "paid" => Some(OrderStatus::Paid),
            "expired" => Some(OrderStatus::Expired),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::Expired | OrderStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buyer {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Priced asset as listed in a sale album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedAsset {
    pub asset_id: Uuid,
    pub album_id: Uuid,
    pub price: Money,
    pub sale_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub asset_id: Uuid,
    pub album_id: Uuid,
    pub unit_price: Money,
}

/// key: retail-order-model -> paid photo bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetailOrder {
    pub id: Uuid,
    pub school_id: SchoolId,
    pub buyer: Buyer,
    pub line_items: Vec<LineItem>,
    pub total_amount: Money,
    pub status: OrderStatus,
    pub payment_intent_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetailOrder {
    pub fn asset_ids(&self) -> Vec<Uuid> {
        self.line_items.iter().map(|item| item.asset_id).collect()
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What the gateway hands back when an intent is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_ref: String,
    pub qr_payload: String,
    pub copy_paste_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Settled,
    Pending,
    Expired,
    Failed,
}

impl IntentStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "settled" | "paid" | "completed" => Some(IntentStatus::Settled),
            "pending" | "active" | "waiting" => Some(IntentStatus::Pending),
            "expired" | "cancelled" | "canceled" => Some(IntentStatus::Expired),
            "failed" | "error" => Some(IntentStatus::Failed),
            _ => None,
        }
    }
}

/// key: download-token-model -> stored digest, never the secret
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadToken {
    pub id: Uuid,
    pub school_id: SchoolId,
    pub order_id: Uuid,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DownloadToken {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.consumed_at.is_none() && self.revoked_at.is_none() && self.expires_at > now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    pub order_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Raw period figures read from the ledger in one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub revenue: Money,
    pub pending_count: i64,
    pub overdue_count: i64,
    pub outstanding_amount: Money,
    pub overdue_amount: Money,
    pub paid_amount: Money,
    pub delinquent_students: i64,
}

/// key: billing-stats -> dashboard rollup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialStats {
    pub period: BillingPeriod,
    pub monthly_revenue: Money,
    pub pending_count: i64,
    pub pending_amount: Money,
    pub overdue_count: i64,
    pub overdue_amount: Money,
    pub paid_amount: Money,
    pub delinquent_students: i64,
    pub delinquency_rate: f64,
    pub collection_rate: f64,
    pub active_students: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_formats_minor_units() {
        assert_eq!(Money::from_minor(4000).to_string(), "40.00");
        assert_eq!(Money::from_minor(5).to_string(), "0.05");
        assert_eq!(Money::from_minor(-1250).to_string(), "-12.50");
    }

    #[test]
    fn money_parses_decimal_strings() {
        assert_eq!(Money::parse_decimal("40"), Some(Money::from_minor(4000)));
        assert_eq!(Money::parse_decimal("40.5"), Some(Money::from_minor(4050)));
        assert_eq!(Money::parse_decimal("0.07"), Some(Money::from_minor(7)));
        assert_eq!(Money::parse_decimal("1.234"), None);
        assert_eq!(Money::parse_decimal("abc"), None);
        assert_eq!(Money::parse_decimal(".5"), None);
    }

    #[test]
    fn period_rejects_out_of_range_months() {
        assert!(BillingPeriod::new(0, 2025).is_err());
        assert!(BillingPeriod::new(13, 2025).is_err());
        assert!(BillingPeriod::new(12, 2025).is_ok());
    }

    #[test]
    fn period_generation_window_is_last_year_to_next_year() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert!(BillingPeriod::new(3, 2025).unwrap().validate_for_generation(today).is_ok());
        assert!(BillingPeriod::new(1, 2027).unwrap().validate_for_generation(today).is_ok());
        assert!(BillingPeriod::new(3, 2024).unwrap().validate_for_generation(today).is_err());
        assert!(BillingPeriod::new(3, 2030).unwrap().validate_for_generation(today).is_err());
    }

    #[test]
    fn december_period_ends_in_january() {
        let period = BillingPeriod::new(12, 2025).unwrap();
        assert_eq!(period.end(), NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
    }

    #[test]
    fn payment_method_accepts_hyphenated_names() {
        assert_eq!(
            PaymentMethod::parse("instant-transfer"),
            Some(PaymentMethod::InstantTransfer)
        );
        assert_eq!(PaymentMethod::parse("CASH"), Some(PaymentMethod::Cash));
        assert_eq!(PaymentMethod::parse("barter"), None);
    }

    #[test]
    fn terminal_order_states() {
        assert!(OrderStatus::Paid.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::AwaitingPayment.is_terminal());
        assert!(!OrderStatus::Created.is_terminal());
    }
}
