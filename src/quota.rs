//! Per-user quota gates.
//!
//! Two gates with strict ordering guarantees: a sliding-window
//! requests-per-minute check and a per-day token budget keyed by the local
//! calendar day of a named timezone. Both run their read-check-write
//! sequence inside one transaction while holding the ledger mutex, so
//! concurrent callers cannot both pass at the boundary.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::Ledger;
use crate::error::{PilotError, QuotaKind};

/// Sliding window length for the RPM gate.
const RPM_WINDOW_MS: i64 = 60_000;

/// Per-user usage totals for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    /// Current local day, `YYYY-MM-DD`.
    pub day: String,
    pub tokens_today: u64,
    pub tokens_month: u64,
    /// Next local midnight, when the daily counter resets.
    pub resets_at: String,
}

/// Enforces per-user RPM and daily-token limits against the ledger.
pub struct QuotaEnforcer {
    ledger: Ledger,
}

impl QuotaEnforcer {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Sliding-window RPM gate: prune events older than 60 s, count the
    /// remainder for `user`, and either reject or record a new event at now.
    pub fn assert_within_rpm(&self, user: &str, limit: u32) -> Result<(), PilotError> {
        let now_ms = Utc::now().timestamp_millis();

        let admitted = self.ledger.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            // Opportunistic prune across all users; old rows are irrelevant.
            tx.execute(
                "DELETE FROM rpm_events WHERE ts_ms < ?1",
                params![now_ms - RPM_WINDOW_MS],
            )?;

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM rpm_events WHERE user_ref = ?1",
                params![user],
                |row| row.get(0),
            )?;

            if count >= i64::from(limit) {
                tx.commit()?;
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO rpm_events (user_ref, ts_ms) VALUES (?1, ?2)",
                params![user, now_ms],
            )?;
            tx.commit()?;
            Ok(true)
        })?;

        if admitted {
            Ok(())
        } else {
            Err(PilotError::Quota {
                kind: QuotaKind::Rpm,
                limit: u64::from(limit),
                when: None,
            })
        }
    }

    /// Add tokens to today's counter for `user`, rejecting without a write
    /// when the cap would be exceeded. The day key is recomputed per call,
    /// so the counter resets at local midnight in `tz`.
    pub fn add_daily_tokens(
        &self,
        user: &str,
        tokens: u64,
        cap: u64,
        tz: &str,
    ) -> Result<(), PilotError> {
        let day = day_key(tz)?;

        let admitted = self.ledger.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let existing: u64 = tx
                .query_row(
                    "SELECT tokens FROM quotas_daily WHERE user_ref = ?1 AND day = ?2",
                    params![user, &day],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);

            if existing + tokens > cap {
                tx.commit()?;
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO quotas_daily (user_ref, day, tokens) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(user_ref, day) DO UPDATE SET tokens = tokens + excluded.tokens",
                params![user, &day, tokens],
            )?;
            tx.commit()?;
            Ok(true)
        })?;

        if admitted {
            Ok(())
        } else {
            Err(PilotError::Quota {
                kind: QuotaKind::Daily,
                limit: cap,
                when: Some(day),
            })
        }
    }

    /// Day and month token totals plus the next reset instant.
    pub fn usage_summary(&self, user: &str, tz: &str) -> Result<UsageSummary, PilotError> {
        let zone = parse_tz(tz)?;
        let local_now = Utc::now().with_timezone(&zone);
        let day = local_now.format("%Y-%m-%d").to_string();
        let month_prefix = local_now.format("%Y-%m").to_string();

        let (tokens_today, tokens_month) = self.ledger.with_conn(|conn| {
            let today: u64 = conn
                .query_row(
                    "SELECT tokens FROM quotas_daily WHERE user_ref = ?1 AND day = ?2",
                    params![user, &day],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);

            let month: u64 = conn.query_row(
                "SELECT COALESCE(SUM(tokens), 0) FROM quotas_daily \
                 WHERE user_ref = ?1 AND day BETWEEN ?2 AND ?3",
                params![
                    user,
                    format!("{month_prefix}-01"),
                    format!("{month_prefix}-31")
                ],
                |row| row.get(0),
            )?;

            Ok((today, month))
        })?;

        let resets_at = next_local_midnight(&zone)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        Ok(UsageSummary {
            day,
            tokens_today,
            tokens_month,
            resets_at,
        })
    }
}

fn parse_tz(tz: &str) -> Result<Tz, PilotError> {
    Tz::from_str(tz).map_err(|_| PilotError::Unknown(format!("unknown timezone: {tz}")))
}

/// `YYYY-MM-DD` for the current instant in `tz`.
pub fn day_key(tz: &str) -> Result<String, PilotError> {
    let zone = parse_tz(tz)?;
    Ok(Utc::now().with_timezone(&zone).format("%Y-%m-%d").to_string())
}

fn next_local_midnight(zone: &Tz) -> Option<chrono::DateTime<Tz>> {
    let local_now = Utc::now().with_timezone(zone);
    let tomorrow = local_now.date_naive().succ_opt()?;
    zone.from_local_datetime(&tomorrow.and_hms_opt(0, 0, 0)?)
        .earliest()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
