//! Billing period arithmetic
//!
//! 상태 전이: `no_funds_received → partial → complete`
//!
//! - 완료 판정: `paid >= expected - tolerance`
//! - due date는 "예정일" 기준으로 전진 (결제일 기준 아님)
//! - 월 단위는 anchor day를 28일로 제한 (2월에도 같은 날짜 유지)

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::Serialize;

use crate::error::PaymentError;
use crate::types::{PaymentSchedule, UsdcAmount};

/// 월 단위 anchor day 상한
pub const MAX_ANCHOR_DAY: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PeriodState {
    NoFundsReceived,
    Partial { remaining: UsdcAmount },
    Complete { overpaid: UsdcAmount },
}

/// 기간 내 누적 금액 판정
pub fn evaluate(expected: UsdcAmount, paid: UsdcAmount, tolerance: UsdcAmount) -> PeriodState {
    if paid.is_zero() {
        return PeriodState::NoFundsReceived;
    }
    if paid < expected.saturating_sub(tolerance) {
        return PeriodState::Partial {
            remaining: expected - paid,
        };
    }
    PeriodState::Complete {
        overpaid: paid - expected,
    }
}

/// 집계 기준 시점. 아직 기간이 시작되지 않았으면 epoch
pub fn period_anchor(previous_due: Option<DateTime<Utc>>) -> DateTime<Utc> {
    previous_due.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// 완료 후 갱신될 due date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueDates {
    pub previous: DateTime<Utc>,
    pub next: DateTime<Utc>,
}

/// due date 전진
///
/// - `current_next`가 있으면: previous = current_next, next = current_next + 1 기간
/// - 없으면 (최초 unlock): 완료 시점부터 시계 시작
pub fn roll_forward(
    schedule: PaymentSchedule,
    current_next: Option<DateTime<Utc>>,
    completed_at: DateTime<Utc>,
) -> Result<DueDates, PaymentError> {
    let start = match current_next {
        Some(scheduled) => scheduled,
        None => match schedule {
            PaymentSchedule::Weekly => completed_at,
            PaymentSchedule::Monthly => cap_anchor_day(completed_at)?,
        },
    };

    Ok(DueDates {
        previous: start,
        next: advance(schedule, start)?,
    })
}

/// 한 기간 뒤
pub fn advance(schedule: PaymentSchedule, from: DateTime<Utc>) -> Result<DateTime<Utc>, PaymentError> {
    match schedule {
        PaymentSchedule::Weekly => Ok(from + Duration::days(7)),
        PaymentSchedule::Monthly => add_month_capped(from),
    }
}

/// 한 달 뒤, 일자는 최대 28일 (1/31 → 2/28, 1/28 → 2/28)
pub fn add_month_capped(from: DateTime<Utc>) -> Result<DateTime<Utc>, PaymentError> {
    cap_anchor_day(from)?
        .checked_add_months(Months::new(1))
        .ok_or_else(|| PaymentError::Configuration(format!("due date overflow after {}", from)))
}

fn cap_anchor_day(at: DateTime<Utc>) -> Result<DateTime<Utc>, PaymentError> {
    if at.day() <= MAX_ANCHOR_DAY {
        return Ok(at);
    }
    at.with_day(MAX_ANCHOR_DAY)
        .ok_or_else(|| PaymentError::Configuration(format!("cannot cap anchor day of {}", at)))
}
