//! Loan receipts: the immutable funding record of one loan.
//!
//! A receipt is encoded with a fixed big-endian layout and identified by the
//! domain-separated BLAKE3 hash of those bytes. The hash is the only key the
//! loan lifecycle uses, so two receipts with identical bytes are the same loan.
//!
//! ```text
//! version            u8
//! principal          u64
//! repayment          u64
//! admin_fee          u64
//! borrower           [u8; 32]
//! maturity           u64
//! duration           u64
//! collateral_token   [u8; 32]
//! collateral_id      u128
//! context_len        u16
//! context            [u8; context_len]
//! node_receipts      (tick u128, used u64, pending u64) * N   -- 32 bytes each, N >= 1
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{LOAN_RECEIPT_VERSION, MAX_NODE_RECEIPTS, MAX_WRAPPER_CONTEXT_LEN};
use crate::error::ReceiptError;
use crate::tick::Tick;
use crate::types::{AccountId, Hash256};

/// Domain separation prefix for receipt hashes.
const RECEIPT_DOMAIN: &[u8] = b"strata/loan-receipt";

/// Size of the fixed header preceding the wrapper context.
const HEADER_SIZE: usize = 1 + 8 * 3 + 32 + 8 * 2 + 32 + 16 + 2;

/// Size of one encoded node receipt.
pub const NODE_RECEIPT_SIZE: usize = 16 + 8 + 8;

/// One node's share of a loan.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeReceipt {
    /// Tick of the funding node.
    pub tick: Tick,
    /// Principal drawn from the node.
    pub used: u64,
    /// Amount owed back to the node (principal plus its interest, net of admin fee).
    pub pending: u64,
}

/// Funding record of one loan.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LoanReceipt {
    /// Layout version.
    pub version: u8,
    /// Principal lent to the borrower.
    pub principal: u64,
    /// Total repayment due at maturity.
    pub repayment: u64,
    /// Admin fee share of `repayment`.
    pub admin_fee: u64,
    /// Borrower account.
    pub borrower: AccountId,
    /// Unix timestamp at which the loan matures.
    pub maturity: u64,
    /// Loan duration in seconds.
    pub duration: u64,
    /// Collateral token (or wrapper) account.
    pub collateral_token: AccountId,
    /// Collateral token id.
    pub collateral_token_id: u128,
    /// Opaque wrapper context, embedded verbatim.
    pub collateral_wrapper_context: Vec<u8>,
    /// Ordered node receipts, lowest tick first.
    pub node_receipts: Vec<NodeReceipt>,
}

impl LoanReceipt {
    /// Unix timestamp at which the loan was originated.
    pub fn origination(&self) -> u64 {
        self.maturity.saturating_sub(self.duration)
    }

    /// Sum of principal drawn across node receipts.
    pub fn total_used(&self) -> Option<u64> {
        self.node_receipts
            .iter()
            .try_fold(0u64, |acc, n| acc.checked_add(n.used))
    }

    /// Sum of amounts owed to nodes.
    pub fn total_pending(&self) -> Option<u64> {
        self.node_receipts
            .iter()
            .try_fold(0u64, |acc, n| acc.checked_add(n.pending))
    }

    /// Encode into the fixed binary layout.
    pub fn encode(&self) -> Result<Vec<u8>, ReceiptError> {
        if self.version != LOAN_RECEIPT_VERSION {
            return Err(ReceiptError::UnsupportedVersion(self.version));
        }
        let context_len = self.collateral_wrapper_context.len();
        if context_len > MAX_WRAPPER_CONTEXT_LEN {
            return Err(ReceiptError::ContextTooLong(context_len));
        }
        if self.node_receipts.is_empty() {
            return Err(ReceiptError::NoNodeReceipts);
        }
        if self.node_receipts.len() > MAX_NODE_RECEIPTS {
            return Err(ReceiptError::TooManyNodeReceipts(self.node_receipts.len()));
        }

        let mut buf = BytesMut::with_capacity(
            HEADER_SIZE + context_len + self.node_receipts.len() * NODE_RECEIPT_SIZE,
        );
        buf.put_u8(self.version);
        buf.put_u64(self.principal);
        buf.put_u64(self.repayment);
        buf.put_u64(self.admin_fee);
        buf.put_slice(self.borrower.as_bytes());
        buf.put_u64(self.maturity);
        buf.put_u64(self.duration);
        buf.put_slice(self.collateral_token.as_bytes());
        buf.put_u128(self.collateral_token_id);
        buf.put_u16(context_len as u16);
        buf.put_slice(&self.collateral_wrapper_context);
        for node in &self.node_receipts {
            buf.put_u128(node.tick.0);
            buf.put_u64(node.used);
            buf.put_u64(node.pending);
        }
        Ok(buf.to_vec())
    }

    /// Decode from the fixed binary layout.
    pub fn decode(mut data: &[u8]) -> Result<Self, ReceiptError> {
        need(data, HEADER_SIZE)?;
        let version = data.get_u8();
        if version != LOAN_RECEIPT_VERSION {
            return Err(ReceiptError::UnsupportedVersion(version));
        }
        let principal = data.get_u64();
        let repayment = data.get_u64();
        let admin_fee = data.get_u64();
        let borrower = AccountId(take_32(&mut data));
        let maturity = data.get_u64();
        let duration = data.get_u64();
        let collateral_token = AccountId(take_32(&mut data));
        let collateral_token_id = data.get_u128();
        let context_len = data.get_u16() as usize;

        need(data, context_len)?;
        let collateral_wrapper_context = data[..context_len].to_vec();
        data.advance(context_len);

        if data.is_empty() {
            return Err(ReceiptError::NoNodeReceipts);
        }
        let trailing = data.len() % NODE_RECEIPT_SIZE;
        if trailing != 0 {
            return Err(ReceiptError::TrailingBytes(trailing));
        }
        let count = data.len() / NODE_RECEIPT_SIZE;
        if count > MAX_NODE_RECEIPTS {
            return Err(ReceiptError::TooManyNodeReceipts(count));
        }
        let mut node_receipts = Vec::with_capacity(count);
        for _ in 0..count {
            node_receipts.push(NodeReceipt {
                tick: Tick(data.get_u128()),
                used: data.get_u64(),
                pending: data.get_u64(),
            });
        }

        Ok(Self {
            version,
            principal,
            repayment,
            admin_fee,
            borrower,
            maturity,
            duration,
            collateral_token,
            collateral_token_id,
            collateral_wrapper_context,
            node_receipts,
        })
    }

    /// Receipt identity: hash of the encoded bytes.
    pub fn hash(&self) -> Result<Hash256, ReceiptError> {
        Ok(hash_encoded(&self.encode()?))
    }
}

/// Hash an already-encoded receipt: `BLAKE3("strata/loan-receipt" || bytes)`.
pub fn hash_encoded(encoded: &[u8]) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(RECEIPT_DOMAIN);
    hasher.update(encoded);
    Hash256(hasher.finalize().into())
}

fn need(data: &[u8], needed: usize) -> Result<(), ReceiptError> {
    if data.remaining() < needed {
        return Err(ReceiptError::Truncated { needed, remaining: data.remaining() });
    }
    Ok(())
}

fn take_32(data: &mut &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    data.copy_to_slice(&mut out);
    out
}
