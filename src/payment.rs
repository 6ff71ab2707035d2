//! Construction of `SendPaymentV2` requests for key-send and hash payments.

use std::collections::HashMap;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{
    error::PaymentError,
    proto::{lnrpc, routerrpc},
};

/// Custom record type carrying the key-send preimage.
pub const KEYSEND_RECORD_TYPE: u64 = 5_482_373_484;
/// Amount of a key-send payment.
pub const KEYSEND_AMOUNT_MSAT: i64 = 1_000;
/// Time lnd may spend finding a route before failing the payment.
pub const PAYMENT_TIMEOUT_SECONDS: i32 = 10;
/// CLTV delta requested for the final hop.
pub const FINAL_CLTV_DELTA: i32 = 40 + 3;
/// No routing fee is allowed.
pub const FEE_LIMIT_MSAT: i64 = 0;

/// 32-byte payment preimage.
#[derive(Clone, PartialEq, Eq)]
pub struct Preimage([u8; 32]);

impl Preimage {
    /// Fresh preimage from the OS RNG.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 of the preimage.
    #[must_use]
    pub fn payment_hash(&self) -> [u8; 32] {
        Sha256::digest(self.0).into()
    }
}

impl std::fmt::Debug for Preimage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Preimage({})", hex::encode(self.payment_hash()))
    }
}

fn outgoing(chan_id: Option<u64>) -> Vec<u64> {
    chan_id.into_iter().collect()
}

/// Key-send payment of [`KEYSEND_AMOUNT_MSAT`] to `destination` carrying `preimage`.
///
/// The preimage is written to [`KEYSEND_RECORD_TYPE`], replacing any caller value there.
#[must_use]
pub fn keysend_request(
    destination: &[u8],
    mut custom_records: HashMap<u64, Vec<u8>>,
    outgoing_chan_id: Option<u64>,
    preimage: &Preimage,
) -> routerrpc::SendPaymentRequest {
    custom_records.insert(KEYSEND_RECORD_TYPE, preimage.as_bytes().to_vec());
    routerrpc::SendPaymentRequest {
        dest: destination.to_vec(),
        amt_msat: KEYSEND_AMOUNT_MSAT,
        payment_hash: preimage.payment_hash().to_vec(),
        fee_limit_msat: FEE_LIMIT_MSAT,
        outgoing_chan_ids: outgoing(outgoing_chan_id),
        dest_custom_records: custom_records,
        dest_features: vec![lnrpc::FeatureBit::TlvOnionOpt as i32],
        timeout_seconds: PAYMENT_TIMEOUT_SECONDS,
        final_cltv_delta: FINAL_CLTV_DELTA,
        ..Default::default()
    }
}

/// Payment of `amount_msat` locked to `payment_hash`, typically paying a hold invoice.
///
/// # Errors
/// [`PaymentError::AmountOutOfRange`] when the amount does not fit lnd's signed field.
pub fn hash_payment_request(
    destination: &[u8],
    outgoing_chan_id: Option<u64>,
    payment_hash: &[u8],
    payment_addr: &[u8],
    amount_msat: u64,
) -> Result<routerrpc::SendPaymentRequest, PaymentError> {
    let amt_msat =
        i64::try_from(amount_msat).map_err(|_| PaymentError::AmountOutOfRange(amount_msat))?;
    Ok(routerrpc::SendPaymentRequest {
        dest: destination.to_vec(),
        amt_msat,
        payment_hash: payment_hash.to_vec(),
        payment_addr: payment_addr.to_vec(),
        fee_limit_msat: FEE_LIMIT_MSAT,
        outgoing_chan_ids: outgoing(outgoing_chan_id),
        timeout_seconds: PAYMENT_TIMEOUT_SECONDS,
        final_cltv_delta: FINAL_CLTV_DELTA,
        ..Default::default()
    })
}
