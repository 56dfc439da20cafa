//! Transaction submission: signing, fee estimation, escalation and the sender engine

mod gas;
mod sender;
mod signer;

pub use gas::{gas_fee_cap, Escalator, FeeData, FeeEstimator};
pub use sender::{Sender, CONFIRM_CHANNEL_CAPACITY};
pub use signer::{
    build_signer, BlobTxRequest, LocalSigner, RemoteSigner, RpcTransaction, SignedTx,
    TransactionSigner, UnsignedTx,
};
