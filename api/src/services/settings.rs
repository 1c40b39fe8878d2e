//! Treasury Settings
//!
//! treasury_settings 테이블(key-value)을 검증된 타입으로 변환.
//! 검증을 통과한 값만 저장되고, 서비스에는 호출마다 명시적으로 전달됨.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use ethers::signers::{LocalWallet, Signer};
use serde::{Deserialize, Serialize};

use super::address_deriver::{AddressDeriver, ExtendedKey};
use crate::db::TreasuryRepository;
use crate::error::PaymentError;
use crate::types::EthAddress;

pub const TREASURY_ADDRESS: &str = "treasury_address";
pub const MASTER_XPUB: &str = "master_xpub";
pub const MASTER_XPRV: &str = "master_xprv";
pub const PAYOUT_WALLET_ADDRESS: &str = "payout_wallet_address";
pub const PAYOUT_WALLET_PRIVATE_KEY: &str = "payout_wallet_private_key";

/// 검증된 treasury 설정
///
/// 민감 값(xprv, payout 개인키)은 getter로만 노출, `Debug`에서 가려짐
#[derive(Clone)]
pub struct TreasurySettings {
    pub treasury_address: EthAddress,
    pub master_xpub: String,
    master_xprv: Option<String>,
    pub payout_wallet_address: Option<EthAddress>,
    payout_wallet_private_key: Option<String>,
}

impl TreasurySettings {
    /// 저장소에서 로드 + 검증
    pub async fn load<S>(store: &S) -> Result<Self, PaymentError>
    where
        S: TreasuryRepository + ?Sized,
    {
        let entries = store.load_treasury_entries().await?;
        Self::from_entries(&entries)
    }

    pub fn from_entries(entries: &HashMap<String, String>) -> Result<Self, PaymentError> {
        let get = |key: &str| entries.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let treasury_address = get(TREASURY_ADDRESS)
            .ok_or_else(|| PaymentError::Configuration("treasury_address is not configured".to_string()))
            .and_then(EthAddress::new)?;

        let master_xpub = get(MASTER_XPUB)
            .ok_or_else(|| PaymentError::Configuration("master_xpub is not configured".to_string()))?
            .to_string();
        if ExtendedKey::parse(&master_xpub)?.is_private() {
            return Err(PaymentError::UnsupportedKeyType(
                "master_xpub must be an extended public key".to_string(),
            ));
        }

        let master_xprv = match get(MASTER_XPRV) {
            Some(xprv) => {
                if !ExtendedKey::parse(xprv)?.is_private() {
                    return Err(PaymentError::UnsupportedKeyType(
                        "master_xprv must be an extended private key".to_string(),
                    ));
                }
                // 같은 계정 키인지: 첫 주소가 같아야 함
                if AddressDeriver::derive_address(xprv, 0)? != AddressDeriver::derive_address(&master_xpub, 0)? {
                    return Err(PaymentError::Configuration(
                        "master_xprv does not belong to master_xpub".to_string(),
                    ));
                }
                Some(xprv.to_string())
            }
            None => None,
        };

        let payout_wallet_address = get(PAYOUT_WALLET_ADDRESS).map(EthAddress::new).transpose()?;
        let payout_wallet_private_key = get(PAYOUT_WALLET_PRIVATE_KEY).map(str::to_string);

        if let Some(key) = &payout_wallet_private_key {
            let wallet = parse_private_key(key)?;
            let derived = EthAddress::from_h160(wallet.address());
            match &payout_wallet_address {
                Some(expected) if expected == &derived => {}
                Some(expected) => {
                    return Err(PaymentError::DerivedAddressMismatch {
                        expected: expected.to_string(),
                        derived: derived.to_string(),
                    })
                }
                None => {
                    return Err(PaymentError::Configuration(
                        "payout_wallet_private_key requires payout_wallet_address".to_string(),
                    ))
                }
            }
        }

        Ok(Self {
            treasury_address,
            master_xpub,
            master_xprv,
            payout_wallet_address,
            payout_wallet_private_key,
        })
    }

    /// sweep 서명용 xprv. 없으면 설정 에러
    pub fn master_xprv(&self) -> Result<&str, PaymentError> {
        self.master_xprv
            .as_deref()
            .ok_or_else(|| PaymentError::Configuration("master_xprv is not configured".to_string()))
    }

    /// gas tank(payout) 지갑
    pub fn payout_wallet(&self) -> Result<LocalWallet, PaymentError> {
        let key = self.payout_wallet_private_key.as_deref().ok_or_else(|| {
            PaymentError::Configuration("payout_wallet_private_key is not configured".to_string())
        })?;
        parse_private_key(key)
    }

    /// 저장용 key-value
    pub fn to_entries(&self) -> Vec<(String, String)> {
        let mut entries = vec![
            (TREASURY_ADDRESS.to_string(), self.treasury_address.to_string()),
            (MASTER_XPUB.to_string(), self.master_xpub.clone()),
        ];
        if let Some(xprv) = &self.master_xprv {
            entries.push((MASTER_XPRV.to_string(), xprv.clone()));
        }
        if let Some(address) = &self.payout_wallet_address {
            entries.push((PAYOUT_WALLET_ADDRESS.to_string(), address.to_string()));
        }
        if let Some(key) = &self.payout_wallet_private_key {
            entries.push((PAYOUT_WALLET_PRIVATE_KEY.to_string(), key.clone()));
        }
        entries
    }

    pub fn redacted(&self) -> RedactedSettings {
        RedactedSettings {
            treasury_address: self.treasury_address.clone(),
            master_xpub: self.master_xpub.clone(),
            master_xprv_configured: self.master_xprv.is_some(),
            payout_wallet_address: self.payout_wallet_address.clone(),
            payout_wallet_key_configured: self.payout_wallet_private_key.is_some(),
        }
    }
}

impl fmt::Debug for TreasurySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreasurySettings")
            .field("treasury_address", &self.treasury_address)
            .field("master_xpub", &self.master_xpub)
            .field("master_xprv", &self.master_xprv.as_ref().map(|_| "<redacted>"))
            .field("payout_wallet_address", &self.payout_wallet_address)
            .field(
                "payout_wallet_private_key",
                &self.payout_wallet_private_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// 관리자 조회용 (비밀 값 제외)
#[derive(Debug, Clone, Serialize)]
pub struct RedactedSettings {
    pub treasury_address: EthAddress,
    pub master_xpub: String,
    pub master_xprv_configured: bool,
    pub payout_wallet_address: Option<EthAddress>,
    pub payout_wallet_key_configured: bool,
}

/// 관리자 갱신 요청. 없는 필드는 기존 값 유지
#[derive(Debug, Default, Deserialize)]
pub struct TreasuryUpdate {
    pub treasury_address: Option<String>,
    pub master_xpub: Option<String>,
    pub master_xprv: Option<String>,
    pub payout_wallet_address: Option<String>,
    pub payout_wallet_private_key: Option<String>,
}

impl TreasuryUpdate {
    /// 기존 값 위에 덮어쓴 뒤 전체를 다시 검증
    pub fn apply(self, mut entries: HashMap<String, String>) -> Result<TreasurySettings, PaymentError> {
        let fields = [
            (TREASURY_ADDRESS, self.treasury_address),
            (MASTER_XPUB, self.master_xpub),
            (MASTER_XPRV, self.master_xprv),
            (PAYOUT_WALLET_ADDRESS, self.payout_wallet_address),
            (PAYOUT_WALLET_PRIVATE_KEY, self.payout_wallet_private_key),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                entries.insert(key.to_string(), value);
            }
        }
        TreasurySettings::from_entries(&entries)
    }
}

fn parse_private_key(key: &str) -> Result<LocalWallet, PaymentError> {
    let hex_key = key.trim().trim_start_matches("0x");
    if hex_key.len() != 64 || !hex_key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PaymentError::Configuration(
            "payout_wallet_private_key must be 32 bytes of hex".to_string(),
        ));
    }
    LocalWallet::from_str(hex_key)
        .map_err(|_| PaymentError::Configuration("payout_wallet_private_key is not a valid key".to_string()))
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::services::address_deriver::test_keys::account_xpub;

    #[test]
    fn test_valid_settings() {
        let settings = settings();
        assert_eq!(settings.treasury_address.as_str(), TREASURY);
        assert!(settings.master_xprv().is_ok());
        assert_eq!(
            EthAddress::from_h160(settings.payout_wallet().unwrap().address()).as_str(),
            PAYOUT_ADDRESS
        );
    }

    #[test]
    fn test_missing_treasury_address() {
        let mut entries = entries();
        entries.remove(TREASURY_ADDRESS);
        let err = TreasurySettings::from_entries(&entries).unwrap_err();
        assert!(matches!(err, PaymentError::Configuration(_)));
    }

    #[test]
    fn test_invalid_treasury_address() {
        let mut entries = entries();
        entries.insert(TREASURY_ADDRESS.to_string(), "0x1234".to_string());
        let err = TreasurySettings::from_entries(&entries).unwrap_err();
        assert!(matches!(err, PaymentError::InvalidAddress(_)));
    }

    #[test]
    fn test_xpub_in_xprv_slot_rejected() {
        let mut entries = entries();
        entries.insert(MASTER_XPRV.to_string(), account_xpub());
        let err = TreasurySettings::from_entries(&entries).unwrap_err();
        assert!(matches!(err, PaymentError::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_payout_key_must_match_address() {
        let mut entries = entries();
        entries.insert(
            PAYOUT_WALLET_ADDRESS.to_string(),
            "0x70997970c51812dc3a010c7d01b50e0d17dc79c8".to_string(),
        );
        let err = TreasurySettings::from_entries(&entries).unwrap_err();
        assert!(matches!(err, PaymentError::DerivedAddressMismatch { .. }));

        let mut entries = super::fixtures::entries();
        entries.insert(PAYOUT_WALLET_PRIVATE_KEY.to_string(), "0xdeadbeef".to_string());
        assert!(TreasurySettings::from_entries(&entries).is_err());
    }

    #[test]
    fn test_xprv_optional() {
        let mut entries = entries();
        entries.remove(MASTER_XPRV);
        let settings = TreasurySettings::from_entries(&entries).unwrap();
        assert!(matches!(settings.master_xprv(), Err(PaymentError::Configuration(_))));
    }

    #[test]
    fn test_debug_and_redacted_hide_secrets() {
        let settings = settings();
        let debug = format!("{:?}", settings);
        assert!(!debug.contains(settings.master_xprv().unwrap()));
        assert!(!debug.contains(PAYOUT_KEY.trim_start_matches("0x")));
        assert!(debug.contains("<redacted>"));

        let json = serde_json::to_string(&settings.redacted()).unwrap();
        assert!(!json.contains("xprv9"));
        assert!(json.contains("\"master_xprv_configured\":true"));
    }

    #[test]
    fn test_update_revalidates() {
        let update = TreasuryUpdate {
            treasury_address: Some("0x000000000000000000000000000000000000cafe".to_string()),
            ..Default::default()
        };
        let settings = update.apply(entries()).unwrap();
        assert_eq!(settings.treasury_address.as_str(), "0x000000000000000000000000000000000000cafe");
        assert_eq!(settings.to_entries().len(), 5);

        let bad = TreasuryUpdate {
            master_xpub: Some("garbage".to_string()),
            ..Default::default()
        };
        assert!(bad.apply(entries()).is_err());
    }
}
