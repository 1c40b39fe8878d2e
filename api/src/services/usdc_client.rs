//! USDC Chain Client
//!
//! Polygon 위 USDC(ERC-20) 조회/전송.
//!
//! # Features
//! - USDC / MATIC 잔액 조회
//! - `transfer(address,uint256)` 전송 (사전 잔액 검증)
//! - 확인(confirmation) 대기: 타임아웃은 실패가 아닌 "미확정"
//! - `Transfer` 이벤트 로그 스캔 (catch-up)
//!
//! 금액은 `UsdcAmount`(고정 소수점)로 다루고, 체인 경계에서만 6 decimals 정수로 변환.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::abi::{self, ParamType, Token};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, Filter, Log,
    TransactionRequest, ValueOrArray, H256, U256, U64,
};
use ethers::utils::{id, keccak256};
use rand::Rng;
use serde::Serialize;

use crate::config::ChainConfig;
use crate::error::PaymentError;
use crate::types::{EthAddress, TxHash, UsdcAmount};

/// `eth_getLogs` 블록 범위 상한 (RPC 제공자 제한)
pub const SCAN_WINDOW_BLOCKS: u64 = 2_000;

/// 영수증 폴링 간격
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// 재시도 정책 (읽기 전용 호출에만 적용)
const RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY_MS: u64 = 250;

/// 관측된 USDC 전송 1건 (webhook / 로그 스캔 공통)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedTransfer {
    pub tx_hash: TxHash,
    pub from: EthAddress,
    pub to: EthAddress,
    pub amount: UsdcAmount,
    pub block_number: u64,
    pub confirmed_at: DateTime<Utc>,
}

/// 확인 대기 결과
///
/// `Pending`은 실패가 아님. 호출자는 나중에 다시 확인해야 함
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Confirmed { block: u64 },
    Reverted,
    Pending,
}

/// 체인 접근 추상화 (서비스 테스트용 mock 교체 가능)
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, PaymentError>;

    async fn usdc_balance(&self, address: &EthAddress) -> Result<UsdcAmount, PaymentError>;

    /// MATIC 잔액 (wei)
    async fn native_balance(&self, address: &EthAddress) -> Result<U256, PaymentError>;

    /// USDC 전송 예상 비용 (gas × gas price, wei)
    async fn estimate_transfer_cost(
        &self,
        from: &EthAddress,
        to: &EthAddress,
        amount: UsdcAmount,
    ) -> Result<U256, PaymentError>;

    /// USDC 전송 제출. 반환된 해시는 아직 미확정
    async fn transfer_usdc(
        &self,
        wallet: &LocalWallet,
        to: &EthAddress,
        amount: UsdcAmount,
    ) -> Result<TxHash, PaymentError>;

    /// MATIC 전송 (gas 충전)
    async fn send_native(&self, wallet: &LocalWallet, to: &EthAddress, wei: U256) -> Result<TxHash, PaymentError>;

    async fn wait_for_confirmation(
        &self,
        tx_hash: &TxHash,
        confirmations: usize,
        timeout: Duration,
    ) -> Result<ConfirmationStatus, PaymentError>;

    /// `to`가 `recipients` 중 하나인 USDC `Transfer` 로그
    async fn scan_transfers(
        &self,
        recipients: &[EthAddress],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ParsedTransfer>, PaymentError>;
}

/// ethers 기반 구현
///
/// # Example
/// ```ignore
/// let client = UsdcClient::new(&config.chain)?;
/// let balance = client.usdc_balance(&address).await?;
/// println!("balance: {} USDC", balance);
/// ```
pub struct UsdcClient {
    provider: Provider<Http>,
    usdc: Address,
    chain_id: u64,
}

impl UsdcClient {
    pub fn new(config: &ChainConfig) -> Result<Self, PaymentError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| PaymentError::Configuration(format!("invalid RPC url: {}", e)))?;

        Ok(Self {
            provider,
            usdc: config.usdc_contract.to_h160()?,
            chain_id: config.chain_id,
        })
    }

    fn signer(&self, wallet: &LocalWallet) -> SignerMiddleware<Provider<Http>, LocalWallet> {
        SignerMiddleware::new(self.provider.clone(), wallet.clone().with_chain_id(self.chain_id))
    }

    async fn submit(&self, wallet: &LocalWallet, tx: TransactionRequest) -> Result<TxHash, PaymentError> {
        let client = self.signer(wallet);
        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| PaymentError::Chain(format!("send_transaction failed: {}", e)))?;

        Ok(TxHash::from_h256(pending.tx_hash()))
    }

    async fn block_timestamp(&self, block: u64) -> Result<DateTime<Utc>, PaymentError> {
        let header = retry_with_backoff("get_block", || async move {
            self.provider
                .get_block(BlockNumber::Number(U64::from(block)))
                .await
                .map_err(chain_error)
        })
        .await?
        .ok_or_else(|| PaymentError::Chain(format!("block {} not found", block)))?;

        Utc.timestamp_opt(header.timestamp.low_u64() as i64, 0)
            .single()
            .ok_or_else(|| PaymentError::Chain(format!("block {} has invalid timestamp", block)))
    }
}

#[async_trait]
impl ChainClient for UsdcClient {
    async fn block_number(&self) -> Result<u64, PaymentError> {
        let head = retry_with_backoff("eth_blockNumber", || async move {
            self.provider.get_block_number().await.map_err(chain_error)
        })
        .await?;
        Ok(head.as_u64())
    }

    async fn usdc_balance(&self, address: &EthAddress) -> Result<UsdcAmount, PaymentError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.usdc)
            .data(encode_balance_of_call(address.to_h160()?))
            .into();

        let tx = &tx;
        let raw = retry_with_backoff("balanceOf", || async move {
            self.provider.call(tx, None).await.map_err(chain_error)
        })
        .await?;

        UsdcAmount::from_u256(decode_uint(&raw, "balanceOf")?)
    }

    async fn native_balance(&self, address: &EthAddress) -> Result<U256, PaymentError> {
        let address = address.to_h160()?;
        retry_with_backoff("eth_getBalance", || async move {
            self.provider.get_balance(address, None).await.map_err(chain_error)
        })
        .await
    }

    async fn estimate_transfer_cost(
        &self,
        from: &EthAddress,
        to: &EthAddress,
        amount: UsdcAmount,
    ) -> Result<U256, PaymentError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(from.to_h160()?)
            .to(self.usdc)
            .data(encode_transfer_call(to.to_h160()?, amount.to_u256()?))
            .into();

        let tx = &tx;
        let gas = retry_with_backoff("eth_estimateGas", || async move {
            self.provider.estimate_gas(tx, None).await.map_err(chain_error)
        })
        .await?;
        let price = retry_with_backoff("eth_gasPrice", || async move {
            self.provider.get_gas_price().await.map_err(chain_error)
        })
        .await?;

        Ok(gas.saturating_mul(price))
    }

    async fn transfer_usdc(
        &self,
        wallet: &LocalWallet,
        to: &EthAddress,
        amount: UsdcAmount,
    ) -> Result<TxHash, PaymentError> {
        let recipient = to.to_h160()?;
        if recipient == Address::zero() {
            return Err(PaymentError::InvalidAddress("refusing to transfer to the zero address".to_string()));
        }
        if amount.is_zero() {
            return Err(PaymentError::InvalidAmount("transfer amount must be positive".to_string()));
        }

        // 사전 잔액 검증: 부족하면 체인에 제출하지 않음
        let sender = EthAddress::from_h160(wallet.address());
        let available = self.usdc_balance(&sender).await?;
        if available < amount {
            return Err(PaymentError::InsufficientBalance {
                available: available.to_string(),
                required: amount.to_string(),
            });
        }

        let tx = TransactionRequest::new()
            .from(wallet.address())
            .to(self.usdc)
            .data(encode_transfer_call(recipient, amount.to_u256()?));

        let hash = self.submit(wallet, tx).await?;
        tracing::info!(from = %sender, to = %to, amount = %amount, tx_hash = %hash, "USDC transfer submitted");
        Ok(hash)
    }

    async fn send_native(&self, wallet: &LocalWallet, to: &EthAddress, wei: U256) -> Result<TxHash, PaymentError> {
        if wei.is_zero() {
            return Err(PaymentError::InvalidAmount("native transfer amount must be positive".to_string()));
        }

        let tx = TransactionRequest::new()
            .from(wallet.address())
            .to(to.to_h160()?)
            .value(wei);

        let hash = self.submit(wallet, tx).await?;
        tracing::info!(to = %to, wei = %wei, tx_hash = %hash, "native transfer submitted");
        Ok(hash)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: &TxHash,
        confirmations: usize,
        timeout: Duration,
    ) -> Result<ConfirmationStatus, PaymentError> {
        let hash = tx_hash.to_h256()?;
        let deadline = tokio::time::Instant::now() + timeout;
        let needed = confirmations.max(1) as u64;

        loop {
            let receipt = retry_with_backoff("eth_getTransactionReceipt", || async move {
                self.provider.get_transaction_receipt(hash).await.map_err(chain_error)
            })
            .await?;

            if let Some(receipt) = receipt {
                if receipt.status == Some(U64::zero()) {
                    return Ok(ConfirmationStatus::Reverted);
                }
                if let Some(block) = receipt.block_number.map(|b| b.as_u64()) {
                    let head = self.block_number().await?;
                    if head.saturating_sub(block) + 1 >= needed {
                        return Ok(ConfirmationStatus::Confirmed { block });
                    }
                }
            }

            if tokio::time::Instant::now() + RECEIPT_POLL_INTERVAL > deadline {
                tracing::warn!(tx_hash = %tx_hash, "confirmation wait timed out; status indeterminate");
                return Ok(ConfirmationStatus::Pending);
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn scan_transfers(
        &self,
        recipients: &[EthAddress],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ParsedTransfer>, PaymentError> {
        if recipients.is_empty() || from_block > to_block {
            return Ok(Vec::new());
        }

        let topics = recipients
            .iter()
            .map(|r| r.to_h160().map(|a| Some(address_to_topic(a))))
            .collect::<Result<Vec<_>, _>>()?;

        let filter = Filter::new()
            .address(self.usdc)
            .topic0(transfer_event_topic())
            .topic2(ValueOrArray::Array(topics))
            .from_block(from_block)
            .to_block(to_block);

        let filter = &filter;
        let logs = retry_with_backoff("eth_getLogs", || async move {
            self.provider.get_logs(filter).await.map_err(chain_error)
        })
        .await?;

        let mut timestamps: HashMap<u64, DateTime<Utc>> = HashMap::new();
        let mut transfers = Vec::with_capacity(logs.len());
        for log in &logs {
            let Some((tx_hash, from, to, amount, block)) = decode_transfer_log(log)? else {
                continue;
            };
            let confirmed_at = match timestamps.get(&block) {
                Some(ts) => *ts,
                None => {
                    let ts = self.block_timestamp(block).await?;
                    timestamps.insert(block, ts);
                    ts
                }
            };
            transfers.push(ParsedTransfer {
                tx_hash,
                from,
                to,
                amount,
                block_number: block,
                confirmed_at,
            });
        }

        tracing::debug!(from_block, to_block, found = transfers.len(), "scanned USDC transfer logs");
        Ok(transfers)
    }
}

fn chain_error(err: impl std::fmt::Display) -> PaymentError {
    PaymentError::Chain(err.to_string())
}

/// 일시적 에러(`is_transient`)만 지수 backoff + jitter로 재시도
pub async fn retry_with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T, PaymentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PaymentError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                let base = RETRY_BASE_DELAY_MS << attempt;
                let jitter = rand::thread_rng().gen_range(0..=base / 2);
                tracing::debug!(call = label, attempt, error = %err, "transient chain error, retrying");
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// 함수 셀렉터 = keccak256(signature)[..4]
pub fn function_selector(signature: &str) -> [u8; 4] {
    id(signature)
}

pub fn transfer_event_topic() -> H256 {
    H256::from(keccak256("Transfer(address,address,uint256)"))
}

/// selector + ABI 인코딩 인자
fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = function_selector(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

/// `transfer(address,uint256)` calldata
pub fn encode_transfer_call(to: Address, amount: U256) -> Bytes {
    encode_call("transfer(address,uint256)", &[Token::Address(to), Token::Uint(amount)])
}

fn encode_balance_of_call(owner: Address) -> Bytes {
    encode_call("balanceOf(address)", &[Token::Address(owner)])
}

/// `balanceOf` 반환값 (uint256 하나)
fn decode_uint(raw: &[u8], call: &str) -> Result<U256, PaymentError> {
    abi::decode(&[ParamType::Uint(256)], raw)
        .ok()
        .and_then(|tokens| tokens.into_iter().next())
        .and_then(Token::into_uint)
        .ok_or_else(|| PaymentError::Chain(format!("{} returned malformed data ({} bytes)", call, raw.len())))
}

/// indexed address 인자는 32바이트 topic으로 왼쪽 패딩됨
fn address_to_topic(address: Address) -> H256 {
    H256::from_slice(&abi::encode(&[Token::Address(address)]))
}

fn topic_to_address(topic: &H256) -> Option<EthAddress> {
    abi::decode(&[ParamType::Address], topic.as_bytes())
        .ok()
        .and_then(|tokens| tokens.into_iter().next())
        .and_then(Token::into_address)
        .map(EthAddress::from_h160)
}

type DecodedTransfer = (TxHash, EthAddress, EthAddress, UsdcAmount, u64);

/// 제거된(reorg) 로그나 pending 로그는 건너뜀
fn decode_transfer_log(log: &Log) -> Result<Option<DecodedTransfer>, PaymentError> {
    if log.removed == Some(true) || log.topics.len() != 3 || log.topics[0] != transfer_event_topic() {
        return Ok(None);
    }
    let (Some(hash), Some(block)) = (log.transaction_hash, log.block_number) else {
        return Ok(None);
    };
    let (Some(from), Some(to)) = (topic_to_address(&log.topics[1]), topic_to_address(&log.topics[2])) else {
        return Ok(None);
    };

    let value = decode_uint(&log.data, "Transfer log")?;
    Ok(Some((
        TxHash::from_h256(hash),
        from,
        to,
        UsdcAmount::from_u256(value)?,
        block.as_u64(),
    )))
}
