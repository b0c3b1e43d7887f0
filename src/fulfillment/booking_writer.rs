//! Schema-tolerant access to the `bookings` table.
//!
//! The table has lived through two column sets. At startup the writer reads the
//! table's columns and selects every layout whose marker column is present; inserts
//! then fill each present column of each selected layout. Legacy money columns hold
//! dollars and are converted here.

use super::fees::{cents_to_dollars, dollars_to_cents, FeeSplit};
use crate::checkout::PackageType;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, Expr, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, DbBackend, DbErr, QueryResult, Statement, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const BOOKINGS_TABLE: &str = "bookings";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("table '{table}' not found")]
    MissingTable { table: String },
    #[error("table '{table}' matches no known booking layout (columns: {columns})")]
    UnknownLayout { table: String, columns: String },
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BookingLayout {
    /// Cents columns, explicit fee rate, per-side-effect failure flags.
    Current,
    /// Dollar columns and a single `needs_attention` flag.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SideEffectFlag {
    Escrow,
    Credits,
}

impl BookingLayout {
    const ALL: [BookingLayout; 2] = [BookingLayout::Current, BookingLayout::Legacy];

    fn marker(self) -> &'static str {
        match self {
            BookingLayout::Current => "booking_number",
            BookingLayout::Legacy => "booking_ref",
        }
    }

    fn number_column(self) -> &'static str {
        self.marker()
    }

    fn intent_column(self) -> &'static str {
        match self {
            BookingLayout::Current => "payment_intent_id",
            BookingLayout::Legacy => "stripe_payment_intent",
        }
    }

    fn flag_column(self, flag: SideEffectFlag) -> &'static str {
        match (self, flag) {
            (BookingLayout::Current, SideEffectFlag::Escrow) => "escrow_failed",
            (BookingLayout::Current, SideEffectFlag::Credits) => "credits_failed",
            (BookingLayout::Legacy, _) => "needs_attention",
        }
    }

    fn columns(self, b: &NewBooking) -> Vec<(&'static str, Value)> {
        let s = &b.split;
        match self {
            BookingLayout::Current => vec![
                ("id", b.id.into()),
                ("booking_number", b.booking_number.clone().into()),
                ("provider_id", b.provider_id.into()),
                ("guardian_id", b.guardian_id.into()),
                ("minor_ids", b.minor_ids_json().into()),
                ("package_type", b.package_type.to_string().into()),
                ("total_sessions", b.total_sessions.into()),
                ("sessions_remaining", b.sessions_remaining.into()),
                ("amount_paid_cents", s.amount_paid_cents.into()),
                ("platform_fee_cents", s.platform_fee_cents.into()),
                ("provider_payout_cents", s.provider_payout_cents.into()),
                ("fee_rate_bps", (s.fee_rate_bps as i32).into()),
                ("currency", b.currency.clone().into()),
                ("payment_intent_id", b.payment_intent_id.clone().into()),
                ("status", b.status.to_string().into()),
                ("session_start", b.session_start.into()),
                ("escrow_failed", false.into()),
                ("credits_failed", false.into()),
                ("created_at", b.created_at.into()),
                ("updated_at", b.created_at.into()),
            ],
            BookingLayout::Legacy => vec![
                ("id", b.id.into()),
                ("booking_ref", b.booking_number.clone().into()),
                ("trainer_id", b.provider_id.into()),
                ("parent_id", b.guardian_id.into()),
                ("athlete_id", b.minor_ids.first().copied().into()),
                ("session_type", b.package_type.to_string().into()),
                ("sessions_purchased", b.total_sessions.into()),
                ("sessions_left", b.sessions_remaining.into()),
                ("total_amount", cents_to_dollars(s.amount_paid_cents).into()),
                ("platform_fee", cents_to_dollars(s.platform_fee_cents).into()),
                ("trainer_payout", cents_to_dollars(s.provider_payout_cents).into()),
                ("stripe_payment_intent", b.payment_intent_id.clone().into()),
                ("status", b.status.to_string().into()),
                ("session_date", b.session_start.into()),
                ("needs_attention", false.into()),
                ("created_at", b.created_at.into()),
            ],
        }
    }
}

/// A booking about to be written, layout independent.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub id: Uuid,
    pub booking_number: String,
    pub provider_id: Uuid,
    pub guardian_id: Uuid,
    pub minor_ids: Vec<Uuid>,
    pub package_type: PackageType,
    pub total_sessions: i32,
    pub sessions_remaining: i32,
    pub split: FeeSplit,
    pub currency: String,
    pub payment_intent_id: String,
    pub status: BookingStatus,
    pub session_start: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewBooking {
    fn minor_ids_json(&self) -> String {
        serde_json::to_string(&self.minor_ids).unwrap_or_else(|_| "[]".to_string())
    }
}

/// A booking read back from whichever layout holds it, amounts in cents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBooking {
    pub id: Uuid,
    pub booking_number: String,
    pub status: String,
    pub total_sessions: i32,
    pub sessions_remaining: i32,
    pub amount_paid_cents: i64,
    pub platform_fee_cents: i64,
    pub provider_payout_cents: i64,
    pub escrow_failed: bool,
    pub credits_failed: bool,
}

#[derive(Debug, Clone)]
pub struct BookingWriter {
    table: String,
    columns: BTreeSet<String>,
    layouts: Vec<BookingLayout>,
}

impl BookingWriter {
    /// Reads the bookings table's columns and picks the matching layouts.
    pub async fn probe<C: ConnectionTrait>(conn: &C) -> Result<Self, SchemaError> {
        Self::probe_table(conn, BOOKINGS_TABLE).await
    }

    pub async fn probe_table<C: ConnectionTrait>(conn: &C, table: &str) -> Result<Self, SchemaError> {
        let backend = conn.get_database_backend();
        let stmt = match backend {
            DbBackend::Sqlite => Statement::from_string(
                backend,
                format!("PRAGMA table_info(\"{}\")", table.replace('"', "")),
            ),
            _ => Statement::from_sql_and_values(
                backend,
                match backend {
                    DbBackend::Postgres => {
                        "SELECT column_name AS name FROM information_schema.columns \
                         WHERE table_name = $1 AND table_schema = current_schema()"
                    }
                    _ => {
                        "SELECT column_name AS name FROM information_schema.columns \
                         WHERE table_name = ? AND table_schema = DATABASE()"
                    }
                },
                [table.into()],
            ),
        };

        let columns: BTreeSet<String> = conn
            .query_all(stmt)
            .await?
            .iter()
            .filter_map(|row| row.try_get::<String>("", "name").ok())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        Self::from_columns(table, columns)
    }

    pub fn from_columns(table: &str, columns: BTreeSet<String>) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::MissingTable {
                table: table.to_string(),
            });
        }

        let layouts: Vec<BookingLayout> = BookingLayout::ALL
            .into_iter()
            .filter(|l| columns.contains(l.marker()) && columns.contains(l.intent_column()))
            .collect();
        if layouts.is_empty() {
            return Err(SchemaError::UnknownLayout {
                table: table.to_string(),
                columns: columns.iter().cloned().collect::<Vec<_>>().join(", "),
            });
        }

        info!(
            table,
            layouts = ?layouts,
            column_count = columns.len(),
            "Booking schema probed"
        );
        Ok(Self {
            table: table.to_string(),
            columns,
            layouts,
        })
    }

    pub fn layouts(&self) -> &[BookingLayout] {
        &self.layouts
    }

    fn primary(&self) -> BookingLayout {
        self.layouts[0]
    }

    fn has(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    pub async fn insert<C: ConnectionTrait>(&self, conn: &C, booking: &NewBooking) -> Result<(), DbErr> {
        let mut names: Vec<&'static str> = Vec::new();
        let mut values: Vec<SimpleExpr> = Vec::new();
        for layout in &self.layouts {
            for (column, value) in layout.columns(booking) {
                if self.has(column) && !names.contains(&column) {
                    names.push(column);
                    values.push(SimpleExpr::Value(value));
                }
            }
        }

        let mut stmt = Query::insert();
        stmt.into_table(Alias::new(self.table.as_str()))
            .columns(names.iter().map(|c| Alias::new(*c)))
            .values(values)
            .map_err(|e| DbErr::Custom(format!("failed to build booking insert: {e}")))?;

        let backend = conn.get_database_backend();
        conn.execute(backend.build(&stmt)).await?;
        Ok(())
    }

    /// Finds a booking already written for this payment, in any selected layout.
    pub async fn find_by_payment_intent<C: ConnectionTrait>(
        &self,
        conn: &C,
        payment_intent_id: &str,
    ) -> Result<Option<StoredBooking>, DbErr> {
        for layout in &self.layouts {
            let found = self
                .select_one(conn, Expr::col(Alias::new(layout.intent_column())).eq(payment_intent_id))
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    pub async fn fetch<C: ConnectionTrait>(&self, conn: &C, booking_id: Uuid) -> Result<Option<StoredBooking>, DbErr> {
        self.select_one(conn, Expr::col(Alias::new("id")).eq(booking_id)).await
    }

    async fn select_one<C: ConnectionTrait>(
        &self,
        conn: &C,
        condition: SimpleExpr,
    ) -> Result<Option<StoredBooking>, DbErr> {
        let columns: Vec<Alias> = self.columns.iter().map(|c| Alias::new(c.as_str())).collect();
        let mut stmt = Query::select();
        stmt.columns(columns)
            .from(Alias::new(self.table.as_str()))
            .and_where(condition)
            .limit(1);

        let backend = conn.get_database_backend();
        match conn.query_one(backend.build(&stmt)).await? {
            Some(row) => self.read_row(&row).map(Some),
            None => Ok(None),
        }
    }

    fn read_row(&self, row: &QueryResult) -> Result<StoredBooking, DbErr> {
        let layout = self.primary();
        let id: Uuid = row.try_get("", "id")?;
        let booking_number: String = row.try_get("", layout.number_column())?;
        let status: String = row.try_get("", "status")?;

        let (total_sessions, sessions_remaining, amount, fee, payout) = match layout {
            BookingLayout::Current => (
                row.try_get::<i32>("", "total_sessions")?,
                row.try_get::<i32>("", "sessions_remaining")?,
                row.try_get::<i64>("", "amount_paid_cents")?,
                row.try_get::<i64>("", "platform_fee_cents")?,
                row.try_get::<i64>("", "provider_payout_cents")?,
            ),
            BookingLayout::Legacy => (
                row.try_get::<i32>("", "sessions_purchased")?,
                row.try_get::<i32>("", "sessions_left")?,
                dollars_to_cents(row.try_get::<f64>("", "total_amount")?),
                dollars_to_cents(row.try_get::<f64>("", "platform_fee")?),
                dollars_to_cents(row.try_get::<f64>("", "trainer_payout")?),
            ),
        };

        let flag = |flag: SideEffectFlag| -> bool {
            self.layouts.iter().any(|l| {
                let column = l.flag_column(flag);
                self.has(column) && row.try_get::<bool>("", column).unwrap_or(false)
            })
        };

        Ok(StoredBooking {
            id,
            booking_number,
            status,
            total_sessions,
            sessions_remaining,
            amount_paid_cents: amount,
            platform_fee_cents: fee,
            provider_payout_cents: payout,
            escrow_failed: flag(SideEffectFlag::Escrow),
            credits_failed: flag(SideEffectFlag::Credits),
        })
    }

    /// Sets the failure flag for a side effect. Returns false when no layout carries a
    /// column for it.
    pub async fn mark_side_effect_failure<C: ConnectionTrait>(
        &self,
        conn: &C,
        booking_id: Uuid,
        flag: SideEffectFlag,
    ) -> Result<bool, DbErr> {
        let columns: BTreeSet<&'static str> = self
            .layouts
            .iter()
            .map(|l| l.flag_column(flag))
            .filter(|c| self.has(c))
            .collect();
        if columns.is_empty() {
            warn!(%booking_id, flag = %flag, "bookings table has no column for side-effect flag");
            return Ok(false);
        }

        let mut stmt = Query::update();
        stmt.table(Alias::new(self.table.as_str()));
        for column in columns {
            stmt.value(Alias::new(column), true);
        }
        if self.has("updated_at") {
            stmt.value(Alias::new("updated_at"), Utc::now());
        }
        stmt.and_where(Expr::col(Alias::new("id")).eq(booking_id));

        let backend = conn.get_database_backend();
        let result = conn.execute(backend.build(&stmt)).await?;
        Ok(result.rows_affected() > 0)
    }
}

/// `BK-YYYYMMDD-XXXXXX` with an uppercase alphanumeric suffix.
pub fn generate_booking_number(now: DateTime<Utc>) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();
    format!("BK-{}-{}", now.format("%Y%m%d"), suffix)
}
