//! Address Deriver
//!
//! # Interview Q&A
//!
//! Q: 사용자별 입금 주소를 왜 HD 파생으로 만드는가?
//! A: 키를 사용자 수만큼 보관하지 않기 위해
//!
//!    ```text
//!    master (seed)
//!      └─ m/44'/60'/0'          ← treasury_settings에 저장되는 account-level xpub/xprv
//!           └─ 0/{index}        ← 사용자별 입금 주소 (index = derivation_index)
//!    ```
//!
//!    - 주소 생성: xpub만 있으면 됨 (서버에 개인키 불필요)
//!    - sweep 서명: xprv로 같은 index 파생
//!
//! Q: 서명 전에 주소를 다시 검증하는 이유는?
//! A: 잘못된 xprv 설정이나 index 손상 시 엉뚱한 키로 서명하는 것을 막기 위해
//!    - 파생된 키의 주소 == DB에 저장된 주소 가 아니면 절대 서명하지 않음
//!    - 불일치는 보안 이벤트로 로깅 (target: "security")

use coins_bip32::prelude::{
    MainnetEncoder, Parent, SigningKey, TestnetEncoder, VerifyingKey, XKeyEncoder, XPriv, XPub,
};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use sha3::{Digest, Keccak256};

use crate::error::PaymentError;
use crate::types::EthAddress;

/// 외부(입금) 체인: `.../0/{index}`
const EXTERNAL_CHAIN: u32 = 0;

/// 비-hardened index 상한 (2^31)
const HARDENED_OFFSET: i64 = 0x8000_0000;

/// 파싱된 확장 키
pub enum ExtendedKey {
    Public(XPub),
    Private(XPriv),
}

impl ExtendedKey {
    /// BIP-32 base58 문자열 파싱
    ///
    /// mainnet xpub/ypub/zpub (SLIP-132 포함), testnet tpub/upub/vpub. private도 동일.
    /// 버전 바이트는 인코딩 구분일 뿐 파생 경로에는 영향 없음
    pub fn parse(encoded: &str) -> Result<Self, PaymentError> {
        let encoded = encoded.trim();
        let prefix = encoded.get(..4).unwrap_or_default();

        let parsed = match prefix {
            "xpub" | "ypub" | "zpub" => MainnetEncoder::xpub_from_base58(encoded).map(ExtendedKey::Public),
            "tpub" | "upub" | "vpub" => TestnetEncoder::xpub_from_base58(encoded).map(ExtendedKey::Public),
            "xprv" | "yprv" | "zprv" => MainnetEncoder::xpriv_from_base58(encoded).map(ExtendedKey::Private),
            "tprv" | "uprv" | "vprv" => TestnetEncoder::xpriv_from_base58(encoded).map(ExtendedKey::Private),
            _ => {
                return Err(PaymentError::UnsupportedKeyType(format!(
                    "unknown extended key prefix {:?}",
                    prefix
                )))
            }
        };

        parsed.map_err(|e| PaymentError::KeyDerivation(format!("invalid extended key: {}", e)))
    }

    pub fn is_private(&self) -> bool {
        matches!(self, ExtendedKey::Private(_))
    }

    fn public(&self) -> XPub {
        match self {
            ExtendedKey::Public(xpub) => xpub.clone(),
            ExtendedKey::Private(xpriv) => xpriv.verify_key(),
        }
    }
}

/// HD 주소 파생기
///
/// 상태 없음. 키는 호출마다 명시적으로 전달 (treasury 설정 주입)
pub struct AddressDeriver;

impl AddressDeriver {
    /// 입금 주소 파생 (공개 키 경로, 외부 노출 안전)
    ///
    /// xprv가 주어져도 공개 키만 사용
    pub fn derive_address(extended_key: &str, index: i64) -> Result<EthAddress, PaymentError> {
        let child = child_index(index)?;
        let account = ExtendedKey::parse(extended_key)?.public();

        let derived = account
            .derive_child(EXTERNAL_CHAIN)
            .and_then(|chain| chain.derive_child(child))
            .map_err(|e| PaymentError::KeyDerivation(e.to_string()))?;

        let key: &VerifyingKey = derived.as_ref();
        Ok(EthAddress::from_h160(verifying_key_to_address(key)))
    }

    /// 서명용 개인키 파생. 공개 확장 키면 `UnsupportedKeyType`
    pub fn derive_private_key(extended_key: &str, index: i64) -> Result<LocalWallet, PaymentError> {
        let child = child_index(index)?;
        let account = match ExtendedKey::parse(extended_key)? {
            ExtendedKey::Private(xpriv) => xpriv,
            ExtendedKey::Public(_) => {
                return Err(PaymentError::UnsupportedKeyType(
                    "signing requires an extended private key (xprv)".to_string(),
                ))
            }
        };

        let derived = account
            .derive_child(EXTERNAL_CHAIN)
            .and_then(|chain| chain.derive_child(child))
            .map_err(|e| PaymentError::KeyDerivation(e.to_string()))?;

        let key: &SigningKey = derived.as_ref();
        LocalWallet::from_bytes(key.to_bytes().as_slice())
            .map_err(|e| PaymentError::KeyDerivation(e.to_string()))
    }

    /// 파생 키의 주소가 저장된 주소와 같은지 확인 (서명 전 필수)
    pub fn verify_derived_address(wallet: &LocalWallet, expected: &EthAddress) -> Result<(), PaymentError> {
        let derived = EthAddress::from_h160(wallet.address());
        if &derived != expected {
            tracing::error!(
                target: "security",
                expected = %expected,
                derived = %derived,
                "derived signing key does not match stored deposit address"
            );
            return Err(PaymentError::DerivedAddressMismatch {
                expected: expected.to_string(),
                derived: derived.to_string(),
            });
        }
        Ok(())
    }

    /// 파생 + 검증을 한 번에. sweep/transfer는 반드시 이 함수로 서명 키를 얻음
    pub fn derive_verified_signer(
        extended_key: &str,
        index: i64,
        expected: &EthAddress,
    ) -> Result<LocalWallet, PaymentError> {
        let wallet = Self::derive_private_key(extended_key, index)?;
        Self::verify_derived_address(&wallet, expected)?;
        Ok(wallet)
    }
}

fn child_index(index: i64) -> Result<u32, PaymentError> {
    if !(0..HARDENED_OFFSET).contains(&index) {
        return Err(PaymentError::KeyDerivation(format!(
            "derivation index {} out of range",
            index
        )));
    }
    Ok(index as u32)
}

/// secp256k1 공개키 → Ethereum 주소 (keccak256(uncompressed[1..])의 마지막 20바이트)
fn verifying_key_to_address(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}


#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;
    use ethers::signers::{coins_bip39::English, MnemonicBuilder};

    #[test]
    fn test_known_hardhat_addresses() {
        let xpub = account_xpub();
        let first = AddressDeriver::derive_address(&xpub, 0).unwrap();
        assert_eq!(first.as_str(), "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");

        let second = AddressDeriver::derive_address(&xpub, 1).unwrap();
        assert_eq!(second.as_str(), "0x70997970c51812dc3a010c7d01b50e0d17dc79c8");
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let xpub = account_xpub();
        let a = AddressDeriver::derive_address(&xpub, 42).unwrap();
        let b = AddressDeriver::derive_address(&xpub, 42).unwrap();
        let c = AddressDeriver::derive_address(&xpub, 43).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_private_key_matches_public_derivation() {
        let wallet = AddressDeriver::derive_private_key(&account_xprv(), 42).unwrap();
        let address = AddressDeriver::derive_address(&account_xpub(), 42).unwrap();
        assert_eq!(EthAddress::from_h160(wallet.address()), address);

        // ethers MnemonicBuilder 경로와도 일치해야 함
        let reference = MnemonicBuilder::<English>::default()
            .phrase(PHRASE)
            .index(42u32)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(wallet.address(), reference.address());
    }

    #[test]
    fn test_xprv_accepted_for_address_derivation() {
        let from_xprv = AddressDeriver::derive_address(&account_xprv(), 5).unwrap();
        let from_xpub = AddressDeriver::derive_address(&account_xpub(), 5).unwrap();
        assert_eq!(from_xprv, from_xpub);
    }

    #[test]
    fn test_private_derivation_rejects_public_key() {
        let err = AddressDeriver::derive_private_key(&account_xpub(), 0).unwrap_err();
        assert!(matches!(err, PaymentError::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let wallet = AddressDeriver::derive_private_key(&account_xprv(), 3).unwrap();
        let wrong = AddressDeriver::derive_address(&account_xpub(), 4).unwrap();

        let err = AddressDeriver::verify_derived_address(&wallet, &wrong).unwrap_err();
        assert!(matches!(err, PaymentError::DerivedAddressMismatch { .. }));

        let right = AddressDeriver::derive_address(&account_xpub(), 3).unwrap();
        assert!(AddressDeriver::derive_verified_signer(&account_xprv(), 3, &right).is_ok());
    }

    #[test]
    fn test_parses_slip132_encoded_keys() {
        // MainnetEncoder는 secp256k1 키를 zpub/zprv 버전으로 직렬화함
        let xpub = account_xpub();
        let xprv = account_xprv();
        assert!(xpub.starts_with("zpub"));
        assert!(xprv.starts_with("zprv"));

        assert!(!ExtendedKey::parse(&xpub).unwrap().is_private());
        assert!(ExtendedKey::parse(&xprv).unwrap().is_private());
        assert!(matches!(
            ExtendedKey::parse("qpub6CUGRUonZSQ4TWtTMmzXdrXDtypWKiKrhko4egpiMZbpiaQL2jkwSB1icqYh2cfDfVxdx4df189oLKnC5fSwqPfgyP3hooxujYzAu3fDVmz"),
            Err(PaymentError::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn test_rejects_garbage_and_bad_index() {
        assert!(ExtendedKey::parse("not-a-key").is_err());
        assert!(ExtendedKey::parse("xpub123").is_err());
        assert!(AddressDeriver::derive_address(&account_xpub(), -1).is_err());
        assert!(AddressDeriver::derive_address(&account_xpub(), HARDENED_OFFSET).is_err());
    }
}
