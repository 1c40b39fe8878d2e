//! Deposit Webhook Boundary
//!
//! # Interview Q&A
//!
//! Q: webhook payload를 왜 타입으로 파싱하는가?
//! A: 체인 모니터링 제공자(Alchemy)의 JSON은 필드가 자주 빠지거나 형식이 바뀜
//!    - 서명 검증 → 타입 파싱 → `ParsedTransfer` 만 비즈니스 로직에 전달
//!    - USDC가 아닌 activity는 걸러냄 (정상)
//!    - USDC activity인데 필드가 깨져 있으면 payload 전체 거부 (제공자가 재전송)
//!
//! Q: webhook은 블록 확정 전에도 도착하는데?
//! A: head 기준 확인 수가 모자란 전송은 기록하지 않고 성공 응답만 보냄
//!    - reorg로 사라질 수 있는 입금을 결제에 반영하지 않음
//!    - 보류된 전송은 catch-up 스캔이 충분히 깊어진 뒤 가져감
//!
//! Q: 서명 비교를 왜 `verify_slice`로 하는가?
//! A: 바이트 단위 `==` 비교는 타이밍 공격에 노출됨. hmac 크레이트의 상수 시간 비교 사용

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use super::usdc_client::ParsedTransfer;
use crate::types::{EthAddress, TxHash, UsdcAmount, USDC_DECIMALS};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-alchemy-signature";

const ADDRESS_ACTIVITY: &str = "ADDRESS_ACTIVITY";

#[derive(Debug, Error, PartialEq)]
pub enum WebhookParseError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unsupported webhook type: {0}")]
    UnsupportedType(String),

    #[error("activity {index}: invalid {field}: {reason}")]
    InvalidActivity {
        index: usize,
        field: &'static str,
        reason: String,
    },
}

/// `hex(HMAC-SHA256(signing_key, raw_body))` 검증
pub fn verify_signature(signing_key: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(signing_key.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlchemyWebhook {
    #[serde(rename = "type")]
    kind: String,
    created_at: Option<DateTime<Utc>>,
    event: AlchemyEvent,
}

#[derive(Debug, Deserialize)]
struct AlchemyEvent {
    #[serde(default)]
    activity: Vec<AlchemyActivity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlchemyActivity {
    from_address: Option<String>,
    to_address: Option<String>,
    block_num: Option<String>,
    hash: Option<String>,
    category: Option<String>,
    raw_contract: Option<RawContract>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContract {
    raw_value: Option<String>,
    address: Option<String>,
    decimals: Option<u32>,
}

/// Address Activity payload → USDC 전송 목록
pub fn parse_address_activity(
    body: &[u8],
    usdc_contract: &EthAddress,
) -> Result<Vec<ParsedTransfer>, WebhookParseError> {
    let payload: AlchemyWebhook =
        serde_json::from_slice(body).map_err(|e| WebhookParseError::Malformed(e.to_string()))?;

    if payload.kind != ADDRESS_ACTIVITY {
        return Err(WebhookParseError::UnsupportedType(payload.kind));
    }

    let observed_at = payload.created_at.unwrap_or_else(Utc::now);
    let mut transfers = Vec::new();

    for (index, activity) in payload.event.activity.iter().enumerate() {
        if !is_usdc_activity(activity, usdc_contract) {
            continue;
        }
        transfers.push(parse_activity(index, activity, observed_at)?);
    }

    Ok(transfers)
}

fn is_usdc_activity(activity: &AlchemyActivity, usdc_contract: &EthAddress) -> bool {
    let is_token = matches!(activity.category.as_deref(), Some("token") | Some("erc20"));
    let contract = activity
        .raw_contract
        .as_ref()
        .and_then(|c| c.address.as_deref())
        .map(|a| a.eq_ignore_ascii_case(usdc_contract.as_str()))
        .unwrap_or(false);
    is_token && contract
}

fn parse_activity(
    index: usize,
    activity: &AlchemyActivity,
    observed_at: DateTime<Utc>,
) -> Result<ParsedTransfer, WebhookParseError> {
    let invalid = |field: &'static str, reason: String| WebhookParseError::InvalidActivity { index, field, reason };
    let required = |field: &'static str, value: &Option<String>| {
        value
            .as_deref()
            .map(str::to_string)
            .ok_or_else(|| invalid(field, "missing".to_string()))
    };

    let tx_hash = TxHash::new(&required("hash", &activity.hash)?).map_err(|e| invalid("hash", e.to_string()))?;
    let from = EthAddress::new(&required("fromAddress", &activity.from_address)?)
        .map_err(|e| invalid("fromAddress", e.to_string()))?;
    let to = EthAddress::new(&required("toAddress", &activity.to_address)?)
        .map_err(|e| invalid("toAddress", e.to_string()))?;

    let block_hex = required("blockNum", &activity.block_num)?;
    let block_number = u64::from_str_radix(block_hex.trim_start_matches("0x"), 16)
        .map_err(|e| invalid("blockNum", e.to_string()))?;

    // rawValue(정수 base units)만 사용. 부동소수점 `value` 필드는 무시
    let contract = activity
        .raw_contract
        .as_ref()
        .ok_or_else(|| invalid("rawContract", "missing".to_string()))?;
    if let Some(decimals) = contract.decimals {
        if decimals != USDC_DECIMALS {
            return Err(invalid("rawContract.decimals", format!("expected {}, got {}", USDC_DECIMALS, decimals)));
        }
    }
    let raw_value = required("rawContract.rawValue", &contract.raw_value)?;
    let units = u128::from_str_radix(raw_value.trim_start_matches("0x"), 16)
        .map_err(|e| invalid("rawContract.rawValue", e.to_string()))?;
    let amount = UsdcAmount::from_base_units(units).map_err(|e| invalid("rawContract.rawValue", e.to_string()))?;

    Ok(ParsedTransfer {
        tx_hash,
        from,
        to,
        amount,
        block_number,
        confirmed_at: observed_at,
    })
}

/// 확인 수 충족 여부로 분리: (처리할 전송, 보류할 전송)
///
/// 확인 수 = `head - block + 1` (포함된 블록 자체가 1)
pub fn split_by_depth(
    transfers: Vec<ParsedTransfer>,
    head: u64,
    required_confirmations: usize,
) -> (Vec<ParsedTransfer>, Vec<ParsedTransfer>) {
    transfers.into_iter().partition(|t| {
        head >= t.block_number && head - t.block_number + 1 >= required_confirmations as u64
    })
}

#[cfg(test)]
pub mod fixtures {
    use super::*;

    pub const USDC: &str = "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359";

    pub fn sign(key: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// USDC activity 1건짜리 payload
    pub fn payload(hash_byte: &str, to: &str, raw_value: &str) -> String {
        serde_json::json!({
            "webhookId": "wh_test",
            "id": "whevt_test",
            "createdAt": "2024-03-01T12:00:00Z",
            "type": "ADDRESS_ACTIVITY",
            "event": {
                "network": "MATIC_MAINNET",
                "activity": [{
                    "fromAddress": "0x1111111111111111111111111111111111111111",
                    "toAddress": to,
                    "blockNum": "0xdf34a3",
                    "hash": format!("0x{}", hash_byte.repeat(32)),
                    "value": 49.75,
                    "asset": "USDC",
                    "category": "token",
                    "rawContract": { "rawValue": raw_value, "address": USDC, "decimals": 6 }
                }]
            }
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    const TO: &str = "0x2222222222222222222222222222222222222222";

    fn usdc() -> EthAddress {
        EthAddress::new(USDC).unwrap()
    }

    #[test]
    fn test_signature_verification() {
        let body = br#"{"type":"ADDRESS_ACTIVITY"}"#;
        let signature = sign("whsec_test", body);

        assert!(verify_signature("whsec_test", body, &signature));
        assert!(!verify_signature("whsec_other", body, &signature));
        assert!(!verify_signature("whsec_test", b"tampered", &signature));
        assert!(!verify_signature("whsec_test", body, "not-hex"));
        assert!(!verify_signature("whsec_test", body, ""));
    }

    #[test]
    fn test_split_by_depth() {
        let body = payload("ab", TO, "0x2f71ff0");
        let block = 0xdf34a3;
        let transfers = parse_address_activity(body.as_bytes(), &usdc()).unwrap();

        // head == block: 확인 1
        let (ready, deferred) = split_by_depth(transfers.clone(), block, 3);
        assert!(ready.is_empty());
        assert_eq!(deferred.len(), 1);

        let (ready, deferred) = split_by_depth(transfers.clone(), block + 2, 3);
        assert_eq!(ready.len(), 1);
        assert!(deferred.is_empty());

        // RPC head가 webhook보다 뒤처진 경우
        let (ready, _) = split_by_depth(transfers, block - 1, 1);
        assert!(ready.is_empty());
    }

    #[test]
    fn test_parse_usdc_transfer() {
        // 0x2f71ff0 = 49_750_000 base units
        let body = payload("ab", TO, "0x2f71ff0");
        let transfers = parse_address_activity(body.as_bytes(), &usdc()).unwrap();

        assert_eq!(transfers.len(), 1);
        let t = &transfers[0];
        assert_eq!(t.to.as_str(), TO);
        assert_eq!(t.amount, "49.75".parse().unwrap());
        assert_eq!(t.block_number, 0xdf34a3);
        assert_eq!(t.confirmed_at.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_non_usdc_activity_filtered() {
        let body = serde_json::json!({
            "type": "ADDRESS_ACTIVITY",
            "event": { "activity": [
                { "category": "external", "hash": "0x01", "value": 1.0 },
                { "category": "token", "rawContract": { "address": "0x0000000000000000000000000000000000000001", "rawValue": "0x1" } }
            ]}
        })
        .to_string();

        assert!(parse_address_activity(body.as_bytes(), &usdc()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_usdc_activity_rejected() {
        let body = payload("zz", TO, "0x2f71ff0");
        let err = parse_address_activity(body.as_bytes(), &usdc()).unwrap_err();
        assert!(matches!(err, WebhookParseError::InvalidActivity { field: "hash", .. }));

        let body = payload("ab", TO, "49.75");
        let err = parse_address_activity(body.as_bytes(), &usdc()).unwrap_err();
        assert!(matches!(err, WebhookParseError::InvalidActivity { field: "rawContract.rawValue", .. }));
    }

    #[test]
    fn test_wrong_type_and_garbage_rejected() {
        let body = br#"{"type":"MINED_TRANSACTION","event":{}}"#;
        assert_eq!(
            parse_address_activity(body, &usdc()).unwrap_err(),
            WebhookParseError::UnsupportedType("MINED_TRANSACTION".to_string())
        );
        assert!(matches!(
            parse_address_activity(b"not json", &usdc()),
            Err(WebhookParseError::Malformed(_))
        ));
    }
}
