//! Helpers for building CRDT payloads in tests.

use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Full state of a fresh document whose `content` text holds `content`.
pub(crate) fn text_update(content: &str) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, content);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Read the `content` text out of an encoded state.
pub(crate) fn text_of(state: &[u8]) -> String {
    let replica = Doc::new();
    let mut txn = replica.transact_mut();
    if let Ok(update) = Update::decode_v1(state) {
        let _ = txn.apply_update(update);
    }
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}
