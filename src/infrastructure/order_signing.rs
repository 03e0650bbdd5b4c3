//! EIP-712 order signing for the CTF exchange
//!
//! Orders are signed locally with the trading key. The struct hash follows the
//! exchange's `Order` type; amounts are integers in 6-decimal base units for
//! both USDC and outcome tokens.

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::order::{OrderRequest, OrderSide};
use crate::domain::repositories::broker_adapter::BrokerError;

pub const CHAIN_ID: u64 = 137;
pub const CTF_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";

const DOMAIN_TYPE: &[u8] =
    b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const ORDER_TYPE: &[u8] = b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)";

/// 6-decimal base units
const UNIT: f64 = 1_000_000.0;

/// Signature scheme the exchange verifies against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Eoa = 0,
    PolyProxy = 1,
    GnosisSafe = 2,
}

/// Order body as the CLOB expects it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrder {
    pub salt: u64,
    pub maker: String,
    pub signer: String,
    pub taker: String,
    pub token_id: String,
    pub maker_amount: String,
    pub taker_amount: String,
    pub expiration: String,
    pub nonce: String,
    pub fee_rate_bps: String,
    pub side: String,
    pub signature_type: u8,
    pub signature: String,
}

pub struct OrderSigner {
    wallet: LocalWallet,
    /// Funds holder when trading through a proxy wallet
    funder: Option<Address>,
    domain_separator: H256,
    order_type_hash: H256,
}

impl OrderSigner {
    pub fn new(private_key: &str, funder: Option<&str>) -> Result<Self, BrokerError> {
        let key = private_key.trim().trim_start_matches("0x");
        let wallet = LocalWallet::from_str(key)
            .map_err(|e| BrokerError::Authentication(format!("invalid private key: {}", e)))?
            .with_chain_id(CHAIN_ID);

        let funder = funder
            .map(|f| {
                Address::from_str(f.trim())
                    .map_err(|e| BrokerError::Authentication(format!("invalid funder address: {}", e)))
            })
            .transpose()?;

        Ok(Self {
            wallet,
            funder,
            domain_separator: domain_separator(),
            order_type_hash: H256::from(keccak256(ORDER_TYPE)),
        })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    fn maker(&self) -> Address {
        self.funder.unwrap_or_else(|| self.wallet.address())
    }

    fn signature_type(&self) -> SignatureType {
        if self.funder.is_some() {
            SignatureType::GnosisSafe
        } else {
            SignatureType::Eoa
        }
    }

    pub fn sign(&self, order: &OrderRequest, salt: u64) -> Result<SignedOrder, BrokerError> {
        let token_id = U256::from_dec_str(&order.token_id)
            .map_err(|e| BrokerError::InvalidOrder(format!("token id {}: {}", order.token_id, e)))?;

        let (maker_amount, taker_amount) = order_amounts(order);
        let side: u8 = match order.side {
            OrderSide::Buy => 0,
            OrderSide::Sell => 1,
        };
        let maker = self.maker();
        let signer = self.wallet.address();
        let signature_type = self.signature_type();

        let mut encoded = Vec::with_capacity(13 * 32);
        encoded.extend_from_slice(self.order_type_hash.as_bytes());
        encoded.extend_from_slice(&word_u256(U256::from(salt)));
        encoded.extend_from_slice(&word_address(maker));
        encoded.extend_from_slice(&word_address(signer));
        encoded.extend_from_slice(&word_address(Address::zero()));
        encoded.extend_from_slice(&word_u256(token_id));
        encoded.extend_from_slice(&word_u256(U256::from(maker_amount)));
        encoded.extend_from_slice(&word_u256(U256::from(taker_amount)));
        // expiration 0: good until cancelled
        encoded.extend_from_slice(&word_u256(U256::zero()));
        encoded.extend_from_slice(&word_u256(U256::zero()));
        encoded.extend_from_slice(&word_u256(U256::zero()));
        encoded.extend_from_slice(&word_u256(U256::from(side)));
        encoded.extend_from_slice(&word_u256(U256::from(signature_type as u8)));
        let struct_hash = keccak256(&encoded);

        let mut digest_input = Vec::with_capacity(66);
        digest_input.extend_from_slice(&[0x19, 0x01]);
        digest_input.extend_from_slice(self.domain_separator.as_bytes());
        digest_input.extend_from_slice(&struct_hash);
        let digest = H256::from(keccak256(&digest_input));

        let signature = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| BrokerError::Authentication(format!("signing failed: {}", e)))?;

        Ok(SignedOrder {
            salt,
            maker: format!("{:?}", maker),
            signer: format!("{:?}", signer),
            taker: format!("{:?}", Address::zero()),
            token_id: order.token_id.clone(),
            maker_amount: maker_amount.to_string(),
            taker_amount: taker_amount.to_string(),
            expiration: "0".to_string(),
            nonce: "0".to_string(),
            fee_rate_bps: "0".to_string(),
            side: order.side.to_string(),
            signature_type: signature_type as u8,
            signature: format!("0x{}", hex::encode(signature.to_vec())),
        })
    }
}

impl std::fmt::Debug for OrderSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderSigner")
            .field("address", &self.wallet.address())
            .field("funder", &self.funder)
            .finish()
    }
}

/// Maker gives, taker receives: USDC for tokens on a buy, tokens for USDC on a sell
fn order_amounts(order: &OrderRequest) -> (u128, u128) {
    let tokens = to_units(order.size);
    let usdc = to_units(order.price.value() * order.size);
    match order.side {
        OrderSide::Buy => (usdc, tokens),
        OrderSide::Sell => (tokens, usdc),
    }
}

fn to_units(amount: f64) -> u128 {
    (amount * UNIT).round().max(0.0) as u128
}

fn word_u256(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

fn word_address(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn domain_separator() -> H256 {
    let exchange = Address::from_str(CTF_EXCHANGE).unwrap_or_default();

    let mut encoded = Vec::with_capacity(5 * 32);
    encoded.extend_from_slice(&keccak256(DOMAIN_TYPE));
    encoded.extend_from_slice(&keccak256(b"Polymarket CTF Exchange"));
    encoded.extend_from_slice(&keccak256(b"1"));
    encoded.extend_from_slice(&word_u256(U256::from(CHAIN_ID)));
    encoded.extend_from_slice(&word_address(exchange));
    H256::from(keccak256(&encoded))
}
