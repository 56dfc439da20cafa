//! Transaction signing backends
//!
//! A sender account signs either in-process with a local key or through an
//! external signer service speaking `eth_signTransaction`. Both produce the
//! same raw encoding for the same unsigned transaction, and both keep the
//! account's next nonce as local state.

use crate::chain::GasPrice;
use crate::config::SignerConfig;
use crate::error::{SenderError, SenderResult};
use crate::types::TxType;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip2930::{AccessList, Eip2930TransactionRequest};
use ethers::utils::{keccak256, rlp::Rlp};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Blob-carrying transaction request.
///
/// Only representable so it can be refused: neither backend can encode it.
#[derive(Debug, Clone, Default)]
pub struct BlobTxRequest {
    pub tx: Eip1559TransactionRequest,
    pub max_fee_per_blob_gas: U256,
    pub blob_versioned_hashes: Vec<H256>,
}

/// A transaction ready to be signed
#[derive(Debug, Clone)]
pub enum UnsignedTx {
    Legacy(TransactionRequest),
    AccessList(Eip2930TransactionRequest),
    DynamicFee(Eip1559TransactionRequest),
    Blob(BlobTxRequest),
}

impl UnsignedTx {
    /// Build a transaction of the given kind
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx_type: TxType,
        from: Address,
        to: Option<Address>,
        value: U256,
        data: Bytes,
        nonce: u64,
        gas_limit: u64,
        gas_price: GasPrice,
    ) -> SenderResult<Self> {
        match (tx_type, gas_price) {
            (TxType::Legacy, GasPrice::Legacy(price)) => Ok(UnsignedTx::Legacy(
                legacy_request(from, to, value, data, nonce, gas_limit, price),
            )),
            (TxType::AccessList, GasPrice::Legacy(price)) => {
                Ok(UnsignedTx::AccessList(Eip2930TransactionRequest::new(
                    legacy_request(from, to, value, data, nonce, gas_limit, price),
                    AccessList::default(),
                )))
            }
            (
                TxType::DynamicFee,
                GasPrice::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
            ) => {
                let mut request = Eip1559TransactionRequest::new()
                    .from(from)
                    .value(value)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas);
                if let Some(to) = to {
                    request = request.to(to);
                }
                Ok(UnsignedTx::DynamicFee(request))
            }
            (tx_type, gas_price) => Err(SenderError::Internal(format!(
                "fee data {:?} does not match transaction type {}",
                gas_price, tx_type
            ))),
        }
    }

    /// Rebuild a previously signed transaction with new fees, keeping nonce,
    /// target, value, payload and gas limit
    pub fn replacement(signed: &TypedTransaction, gas_price: GasPrice) -> SenderResult<Self> {
        match (signed, gas_price) {
            (TypedTransaction::Legacy(request), GasPrice::Legacy(price)) => {
                Ok(UnsignedTx::Legacy(request.clone().gas_price(price)))
            }
            (TypedTransaction::Eip2930(request), GasPrice::Legacy(price)) => {
                let mut request = request.clone();
                request.tx = request.tx.gas_price(price);
                Ok(UnsignedTx::AccessList(request))
            }
            (
                TypedTransaction::Eip1559(request),
                GasPrice::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
            ) => Ok(UnsignedTx::DynamicFee(
                request
                    .clone()
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas),
            )),
            (_, gas_price) => Err(SenderError::Internal(format!(
                "fee data {:?} does not match the replaced transaction",
                gas_price
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UnsignedTx::Legacy(_) => "LegacyTx",
            UnsignedTx::AccessList(_) => "AccessListTx",
            UnsignedTx::DynamicFee(_) => "DynamicFeeTx",
            UnsignedTx::Blob(_) => "BlobTx",
        }
    }

    fn into_typed(self, from: Address, chain_id: u64) -> SenderResult<TypedTransaction> {
        let mut typed = match self {
            UnsignedTx::Legacy(request) => TypedTransaction::Legacy(request),
            UnsignedTx::AccessList(request) => TypedTransaction::Eip2930(request),
            UnsignedTx::DynamicFee(request) => TypedTransaction::Eip1559(request),
            UnsignedTx::Blob(_) => {
                return Err(SenderError::UnsupportedTransactionType("BlobTx".to_string()))
            }
        };
        typed.set_from(from);
        typed.set_chain_id(chain_id);
        Ok(typed)
    }
}

fn legacy_request(
    from: Address,
    to: Option<Address>,
    value: U256,
    data: Bytes,
    nonce: u64,
    gas_limit: u64,
    gas_price: U256,
) -> TransactionRequest {
    let mut request = TransactionRequest::new()
        .from(from)
        .value(value)
        .data(data)
        .nonce(nonce)
        .gas(gas_limit)
        .gas_price(gas_price);
    if let Some(to) = to {
        request = request.to(to);
    }
    request
}

/// A signed transaction and its canonical encoding
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw: Bytes,
    pub hash: H256,
    pub tx: TypedTransaction,
    pub signature: Signature,
}

impl SignedTx {
    fn from_parts(tx: TypedTransaction, signature: Signature) -> Self {
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        Self {
            raw,
            hash,
            tx,
            signature,
        }
    }

    /// Decode a raw signed transaction, as persisted or returned by a signer
    pub fn decode(raw: &Bytes) -> SenderResult<Self> {
        let (tx, signature) = TypedTransaction::decode_signed(&Rlp::new(raw.as_ref()))
            .map_err(|e| SenderError::Decode(e.to_string()))?;
        Ok(Self {
            raw: raw.clone(),
            hash: H256::from(keccak256(raw)),
            tx,
            signature,
        })
    }

    pub fn nonce(&self) -> u64 {
        self.tx.nonce().map(|n| n.low_u64()).unwrap_or_default()
    }

    pub fn gas_limit(&self) -> u64 {
        self.tx.gas().map(|g| g.low_u64()).unwrap_or_default()
    }

    /// Fee fields of the signed transaction
    pub fn gas_price(&self) -> GasPrice {
        match &self.tx {
            TypedTransaction::Eip1559(request) => GasPrice::Eip1559 {
                max_fee_per_gas: request.max_fee_per_gas.unwrap_or_default(),
                max_priority_fee_per_gas: request.max_priority_fee_per_gas.unwrap_or_default(),
            },
            TypedTransaction::Legacy(request) => {
                GasPrice::Legacy(request.gas_price.unwrap_or_default())
            }
            TypedTransaction::Eip2930(request) => {
                GasPrice::Legacy(request.tx.gas_price.unwrap_or_default())
            }
        }
    }

    pub fn tx_type(&self) -> TxType {
        match &self.tx {
            TypedTransaction::Legacy(_) => TxType::Legacy,
            TypedTransaction::Eip2930(_) => TxType::AccessList,
            TypedTransaction::Eip1559(_) => TxType::DynamicFee,
        }
    }

    /// Recover the signing account
    pub fn recover_sender(&self) -> SenderResult<Address> {
        self.signature
            .recover(self.tx.sighash())
            .map_err(|e| SenderError::Signer(format!("signature recovery failed: {}", e)))
    }
}

/// Signing capability of one sender account
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Sign a transaction on behalf of `address()`
    async fn sign_transaction(&self, tx: UnsignedTx) -> SenderResult<SignedTx>;

    fn address(&self) -> Address;

    /// Next nonce to use for this account
    fn nonce(&self) -> u64;

    fn set_nonce(&mut self, nonce: u64);

    fn signer_type(&self) -> &'static str;
}

/// Signer holding the private key in-process
pub struct LocalSigner {
    wallet: LocalWallet,
    chain_id: u64,
    nonce: u64,
}

impl LocalSigner {
    pub fn new(private_key: &str, chain_id: u64) -> SenderResult<Self> {
        let wallet = private_key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| SenderError::Config(format!("Invalid private key: {}", e)))?
            .with_chain_id(chain_id);

        Ok(Self {
            wallet,
            chain_id,
            nonce: 0,
        })
    }
}

#[async_trait]
impl TransactionSigner for LocalSigner {
    async fn sign_transaction(&self, tx: UnsignedTx) -> SenderResult<SignedTx> {
        let typed = tx.into_typed(self.wallet.address(), self.chain_id)?;
        let signature = self
            .wallet
            .sign_transaction_sync(&typed)
            .map_err(|e| SenderError::Signer(e.to_string()))?;
        Ok(SignedTx::from_parts(typed, signature))
    }

    fn address(&self) -> Address {
        self.wallet.address()
    }

    fn nonce(&self) -> u64 {
        self.nonce
    }

    fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    fn signer_type(&self) -> &'static str {
        "PrivateKey"
    }
}

/// Canonical transaction request of an `eth_signTransaction` service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub from: Address,
    pub to: Option<Address>,
    pub gas: U64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,
    pub nonce: U64,
    pub value: U256,
    pub data: Bytes,
}

impl RpcTransaction {
    fn from_unsigned(from: Address, tx: &UnsignedTx) -> SenderResult<Self> {
        let to_address = |to: Option<&NameOrAddress>| to.and_then(|t| t.as_address().copied());

        match tx {
            UnsignedTx::Legacy(request) => Ok(Self {
                from,
                to: to_address(request.to.as_ref()),
                gas: request.gas.unwrap_or_default().low_u64().into(),
                gas_price: Some(request.gas_price.unwrap_or_default()),
                max_priority_fee_per_gas: None,
                max_fee_per_gas: None,
                nonce: request.nonce.unwrap_or_default().low_u64().into(),
                value: request.value.unwrap_or_default(),
                data: request.data.clone().unwrap_or_default(),
            }),
            UnsignedTx::DynamicFee(request) => Ok(Self {
                from,
                to: to_address(request.to.as_ref()),
                gas: request.gas.unwrap_or_default().low_u64().into(),
                gas_price: None,
                max_priority_fee_per_gas: Some(
                    request.max_priority_fee_per_gas.unwrap_or_default(),
                ),
                max_fee_per_gas: Some(request.max_fee_per_gas.unwrap_or_default()),
                nonce: request.nonce.unwrap_or_default().low_u64().into(),
                value: request.value.unwrap_or_default(),
                data: request.data.clone().unwrap_or_default(),
            }),
            other => Err(SenderError::UnsupportedTransactionType(format!(
                "{} is not supported by the remote signer",
                other.kind()
            ))),
        }
    }
}

/// Signer delegating to an external `eth_signTransaction` service
pub struct RemoteSigner {
    address: Address,
    endpoint: String,
    client: Provider<Http>,
    nonce: u64,
}

impl RemoteSigner {
    pub fn new(address: Address, endpoint: &str) -> SenderResult<Self> {
        let client = Provider::<Http>::try_from(endpoint).map_err(|e| {
            SenderError::Config(format!("Invalid remote signer url {}: {}", endpoint, e))
        })?;

        Ok(Self {
            address,
            endpoint: endpoint.to_string(),
            client,
            nonce: 0,
        })
    }
}

#[async_trait]
impl TransactionSigner for RemoteSigner {
    async fn sign_transaction(&self, tx: UnsignedTx) -> SenderResult<SignedTx> {
        let request = RpcTransaction::from_unsigned(self.address, &tx)?;

        let raw: Bytes = self
            .client
            .request("eth_signTransaction", [request])
            .await
            .map_err(|e| {
                error!(endpoint = %self.endpoint, error = %e, "Remote signer request failed");
                SenderError::Signer(e.to_string())
            })?;

        let signed = SignedTx::decode(&raw)?;
        let recovered = signed.recover_sender()?;
        if recovered != self.address {
            return Err(SenderError::Signer(format!(
                "remote signer returned a transaction signed by {:?}, expected {:?}",
                recovered, self.address
            )));
        }

        debug!(hash = ?signed.hash, nonce = signed.nonce(), "Remote signer signed transaction");
        Ok(signed)
    }

    fn address(&self) -> Address {
        self.address
    }

    fn nonce(&self) -> u64 {
        self.nonce
    }

    fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    fn signer_type(&self) -> &'static str {
        "RemoteSigner"
    }
}

/// Construct the signer described by `config`
pub fn build_signer(
    config: &SignerConfig,
    chain_id: u64,
) -> SenderResult<Box<dyn TransactionSigner>> {
    let signer: Box<dyn TransactionSigner> = match config {
        SignerConfig::PrivateKey { private_key } => {
            Box::new(LocalSigner::new(private_key, chain_id)?)
        }
        SignerConfig::RemoteSigner {
            signer_address,
            remote_signer_url,
        } => {
            let address = signer_address.parse::<Address>().map_err(|e| {
                SenderError::Config(format!("Invalid signer address {}: {}", signer_address, e))
            })?;
            Box::new(RemoteSigner::new(address, remote_signer_url)?)
        }
    };

    info!(
        signer_type = signer.signer_type(),
        address = ?signer.address(),
        "Transaction signer initialized"
    );
    Ok(signer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    const KEY: &str = "1212121212121212121212121212121212121212121212121212121212121212";
    const CHAIN_ID: u64 = 5;

    fn legacy_tx(from: Address) -> UnsignedTx {
        UnsignedTx::new(
            TxType::Legacy,
            from,
            Some(Address::repeat_byte(0x22)),
            U256::from(7),
            Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            3,
            21_000,
            GasPrice::Legacy(U256::from(1_000_000_000u64)),
        )
        .unwrap()
    }

    fn dynamic_tx(from: Address) -> UnsignedTx {
        UnsignedTx::new(
            TxType::DynamicFee,
            from,
            Some(Address::repeat_byte(0x22)),
            U256::zero(),
            Bytes::from(vec![0x01]),
            4,
            50_000,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(3_000_000_000u64),
                max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            },
        )
        .unwrap()
    }

    async fn sign_transaction_handler(
        State(wallet): State<LocalWallet>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let id = body["id"].clone();
        let request: RpcTransaction = serde_json::from_value(body["params"][0].clone()).unwrap();

        let mut typed: TypedTransaction = match request.gas_price {
            Some(gas_price) => {
                let mut tx = TransactionRequest::new()
                    .from(request.from)
                    .gas(request.gas.as_u64())
                    .gas_price(gas_price)
                    .nonce(request.nonce.as_u64())
                    .value(request.value)
                    .data(request.data.clone());
                if let Some(to) = request.to {
                    tx = tx.to(to);
                }
                tx.into()
            }
            None => {
                let mut tx = Eip1559TransactionRequest::new()
                    .from(request.from)
                    .gas(request.gas.as_u64())
                    .max_fee_per_gas(request.max_fee_per_gas.unwrap())
                    .max_priority_fee_per_gas(request.max_priority_fee_per_gas.unwrap())
                    .nonce(request.nonce.as_u64())
                    .value(request.value)
                    .data(request.data.clone());
                if let Some(to) = request.to {
                    tx = tx.to(to);
                }
                tx.into()
            }
        };
        typed.set_chain_id(CHAIN_ID);

        let signature = wallet.sign_transaction_sync(&typed).unwrap();
        let raw = typed.rlp_signed(&signature);
        Json(json!({ "jsonrpc": "2.0", "id": id, "result": raw }))
    }

    async fn spawn_remote_signer(wallet: LocalWallet) -> String {
        let app = Router::new()
            .route("/", post(sign_transaction_handler))
            .with_state(wallet);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_local_and_remote_signers_agree() {
        let local = LocalSigner::new(KEY, CHAIN_ID).unwrap();
        let wallet = KEY.parse::<LocalWallet>().unwrap().with_chain_id(CHAIN_ID);
        let url = spawn_remote_signer(wallet).await;
        let remote = RemoteSigner::new(local.address(), &url).unwrap();

        for build in [legacy_tx, dynamic_tx] {
            let from = local.address();
            let by_local = local.sign_transaction(build(from)).await.unwrap();
            let by_remote = remote.sign_transaction(build(from)).await.unwrap();

            assert_eq!(by_local.hash, by_remote.hash);
            assert_eq!(by_local.raw, by_remote.raw);
        }
    }

    #[tokio::test]
    async fn test_remote_signer_rejects_foreign_signature() {
        let wallet = KEY.parse::<LocalWallet>().unwrap().with_chain_id(CHAIN_ID);
        let url = spawn_remote_signer(wallet).await;
        let claimed = Address::repeat_byte(0x99);
        let remote = RemoteSigner::new(claimed, &url).unwrap();

        let err = remote.sign_transaction(legacy_tx(claimed)).await.unwrap_err();
        assert!(matches!(err, SenderError::Signer(_)));
    }

    #[tokio::test]
    async fn test_blob_transactions_are_rejected() {
        let remote = RemoteSigner::new(Address::repeat_byte(0x01), "http://127.0.0.1:1").unwrap();
        let err = remote
            .sign_transaction(UnsignedTx::Blob(BlobTxRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::UnsupportedTransactionType(_)));

        let local = LocalSigner::new(KEY, CHAIN_ID).unwrap();
        let err = local
            .sign_transaction(UnsignedTx::Blob(BlobTxRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::UnsupportedTransactionType(_)));
    }

    #[tokio::test]
    async fn test_remote_signer_rejects_access_list_kind() {
        let remote = RemoteSigner::new(Address::repeat_byte(0x01), "http://127.0.0.1:1").unwrap();
        let tx = UnsignedTx::new(
            TxType::AccessList,
            remote.address(),
            None,
            U256::zero(),
            Bytes::new(),
            0,
            21_000,
            GasPrice::Legacy(U256::one()),
        )
        .unwrap();

        let err = remote.sign_transaction(tx).await.unwrap_err();
        assert!(matches!(err, SenderError::UnsupportedTransactionType(_)));
    }

    #[tokio::test]
    async fn test_signed_transaction_round_trips_through_raw_encoding() {
        let local = LocalSigner::new(KEY, CHAIN_ID).unwrap();
        let signed = local.sign_transaction(dynamic_tx(local.address())).await.unwrap();

        let decoded = SignedTx::decode(&signed.raw).unwrap();
        assert_eq!(decoded.hash, signed.hash);
        assert_eq!(decoded.nonce(), 4);
        assert_eq!(decoded.gas_limit(), 50_000);
        assert_eq!(decoded.tx_type(), TxType::DynamicFee);
        assert_eq!(decoded.recover_sender().unwrap(), local.address());
    }

    #[test]
    fn test_mismatched_fee_data_rejected() {
        let err = UnsignedTx::new(
            TxType::DynamicFee,
            Address::zero(),
            None,
            U256::zero(),
            Bytes::new(),
            0,
            21_000,
            GasPrice::Legacy(U256::one()),
        )
        .unwrap_err();
        assert!(matches!(err, SenderError::Internal(_)));
    }

    #[test]
    fn test_invalid_private_key() {
        assert!(matches!(
            LocalSigner::new("not-a-key", CHAIN_ID),
            Err(SenderError::Config(_))
        ));
    }
}
