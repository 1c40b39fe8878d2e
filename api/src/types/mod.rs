//! Common Types Module
//!
//! 애플리케이션 전반에서 사용되는 공통 타입 정의
//!
//! 외부 입력(webhook, RPC, 관리자 API)은 전부 이 타입들을 통과해야 함.
//! 생성자에서 검증하므로 내부 로직은 형식 오류를 신경 쓰지 않는다.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

use ethers::types::{Address, H256, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PaymentError;

/// USDC decimals (Polygon 네이티브 USDC)
pub const USDC_DECIMALS: u32 = 6;

/// API 응답 래퍼
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

// ============ EthAddress ============

/// Ethereum/Polygon 주소 (`0x` + 40 hex, lowercase로 정규화)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "String", into = "String")]
#[sqlx(transparent)]
pub struct EthAddress(String);

impl EthAddress {
    pub fn new(addr: &str) -> Result<Self, PaymentError> {
        let addr = addr.trim().to_lowercase();
        if is_hex_with_prefix(&addr, 40) {
            Ok(Self(addr))
        } else {
            Err(PaymentError::InvalidAddress(addr))
        }
    }

    pub fn from_h160(address: Address) -> Self {
        Self(format!("{:#x}", address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// ethers `Address`로 변환 (체인 호출 경계에서만 사용)
    pub fn to_h160(&self) -> Result<Address, PaymentError> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(&self.0[2..], &mut bytes)
            .map_err(|_| PaymentError::InvalidAddress(self.0.clone()))?;
        Ok(Address::from(bytes))
    }
}

impl FromStr for EthAddress {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EthAddress {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<EthAddress> for String {
    fn from(value: EthAddress) -> Self {
        value.0
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============ TxHash ============

/// 트랜잭션 해시 (`0x` + 64 hex). 입금 처리의 멱등성 키.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "String", into = "String")]
#[sqlx(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn new(hash: &str) -> Result<Self, PaymentError> {
        let hash = hash.trim().to_lowercase();
        if is_hex_with_prefix(&hash, 64) {
            Ok(Self(hash))
        } else {
            Err(PaymentError::InvalidTxHash(hash))
        }
    }

    pub fn from_h256(hash: H256) -> Self {
        Self(format!("{:#x}", hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_h256(&self) -> Result<H256, PaymentError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&self.0[2..], &mut bytes)
            .map_err(|_| PaymentError::InvalidTxHash(self.0.clone()))?;
        Ok(H256::from(bytes))
    }
}

impl TryFrom<String> for TxHash {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<TxHash> for String {
    fn from(value: TxHash) -> Self {
        value.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_hex_with_prefix(value: &str, hex_len: usize) -> bool {
    value.len() == hex_len + 2
        && value.starts_with("0x")
        && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

// ============ UsdcAmount ============

/// USDC 금액 (고정소수점, 음수 불가)
///
/// # Design Decision
///
/// 금액 비교/합산은 전부 `Decimal`로 처리하고,
/// 6 decimals 정수(base units) 변환은 체인 호출 직전에만 수행.
/// f64는 0.1 + 0.2 != 0.3 문제로 사용 금지.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "Decimal", into = "Decimal")]
#[sqlx(transparent)]
pub struct UsdcAmount(Decimal);

impl UsdcAmount {
    pub const ZERO: UsdcAmount = UsdcAmount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(PaymentError::InvalidAmount(format!("negative amount {}", value)));
        }
        if value.normalize().scale() > USDC_DECIMALS {
            return Err(PaymentError::InvalidAmount(format!(
                "{} has more than {} decimal places",
                value, USDC_DECIMALS
            )));
        }
        Ok(Self(value))
    }

    /// 6 decimals 정수 → 금액
    pub fn from_base_units(units: u128) -> Result<Self, PaymentError> {
        let units = i128::try_from(units)
            .map_err(|_| PaymentError::InvalidAmount(format!("{} base units overflow", units)))?;
        Decimal::try_from_i128_with_scale(units, USDC_DECIMALS)
            .map(Self)
            .map_err(|e| PaymentError::InvalidAmount(e.to_string()))
    }

    pub fn from_u256(units: U256) -> Result<Self, PaymentError> {
        if units > U256::from(u128::MAX) {
            return Err(PaymentError::InvalidAmount(format!("{} base units overflow", units)));
        }
        Self::from_base_units(units.as_u128())
    }

    /// 금액 → 6 decimals 정수 (체인 호출 경계)
    pub fn to_base_units(&self) -> Result<u128, PaymentError> {
        (self.0 * Decimal::from(10u64.pow(USDC_DECIMALS)))
            .trunc()
            .to_u128()
            .ok_or_else(|| PaymentError::InvalidAmount(format!("{} out of range", self.0)))
    }

    pub fn to_u256(&self) -> Result<U256, PaymentError> {
        self.to_base_units().map(U256::from)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// 0 아래로 내려가지 않는 뺄셈
    pub fn saturating_sub(self, other: UsdcAmount) -> UsdcAmount {
        if other.0 >= self.0 {
            UsdcAmount::ZERO
        } else {
            UsdcAmount(self.0 - other.0)
        }
    }

    /// basis points 비율 (100 bps = 1%), 6 decimals 아래는 버림
    pub fn bps(&self, bps: u32) -> UsdcAmount {
        let raw = self.0 * Decimal::from(bps) / Decimal::from(10_000u32);
        UsdcAmount(raw.trunc_with_scale(USDC_DECIMALS))
    }
}

impl FromStr for UsdcAmount {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())
            .map_err(|_| PaymentError::InvalidAmount(format!("not a decimal: {}", s)))?;
        Self::new(value)
    }
}

impl TryFrom<Decimal> for UsdcAmount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UsdcAmount> for Decimal {
    fn from(value: UsdcAmount) -> Self {
        value.0
    }
}

impl Add for UsdcAmount {
    type Output = UsdcAmount;

    fn add(self, rhs: UsdcAmount) -> UsdcAmount {
        UsdcAmount(self.0 + rhs.0)
    }
}

impl Sub for UsdcAmount {
    type Output = UsdcAmount;

    /// 음수 결과는 0 (금액은 음수가 될 수 없음)
    fn sub(self, rhs: UsdcAmount) -> UsdcAmount {
        self.saturating_sub(rhs)
    }
}

impl Sum for UsdcAmount {
    fn sum<I: Iterator<Item = UsdcAmount>>(iter: I) -> Self {
        iter.fold(UsdcAmount::ZERO, Add::add)
    }
}

impl fmt::Display for UsdcAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============ Domain Enums ============

/// 구독 주기
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_schedule", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentSchedule {
    Weekly,
    Monthly,
}

impl PaymentSchedule {
    pub fn subscription_type(&self) -> PaymentType {
        match self {
            PaymentSchedule::Weekly => PaymentType::WeeklySubscription,
            PaymentSchedule::Monthly => PaymentType::MonthlySubscription,
        }
    }
}

/// 결제 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// 최초 1회 잠금 해제 (unlock fee)
    InitialUnlock,
    WeeklySubscription,
    MonthlySubscription,
}

/// 입금 트랜잭션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "deposit_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Confirmed,
    /// 기간 내 누적 금액이 아직 부족함
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "commission_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommissionType {
    DirectBonus,
    Residual,
    /// 초과 입금분 (같은 사용자에게 돌려줄 금액)
    OverpaymentCredit,
}

/// 커미션 상태: pending → paid | cancelled 만 허용
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "commission_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommissionStatus {
    Pending,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sweep_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SweepStatus {
    /// 전송됨, 확정 대기 (timeout이면 이 상태로 남음)
    Submitted,
    Confirmed,
    Failed,
}
