//! Per-iteration collector of transaction participants.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{AddressRelation, AddressRelationKind};

type Key = (u64, String, AddressRelationKind);

/// Deduplicates `(block, tx, kind) -> addresses` while range pipelines run.
///
/// The engine creates a fresh collector for every iteration and drains it
/// once all pipelines have settled.
#[derive(Debug, Default)]
pub struct AddressCollector {
    entries: BTreeMap<Key, BTreeSet<String>>,
}

impl AddressCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the participants of one transaction. Empty addresses are skipped.
    pub fn add<'a, I>(&mut self, block_number: u64, tx_hash: &str, kind: AddressRelationKind, addresses: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let set = self
            .entries
            .entry((block_number, tx_hash.to_string(), kind))
            .or_default();
        for address in addresses {
            if !address.is_empty() {
                set.insert(address.to_string());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every relation collected so far.
    pub fn drain(&mut self) -> Vec<AddressRelation> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .flat_map(|((block_number, transaction_hash, kind), addresses)| {
                addresses.into_iter().map(move |address| AddressRelation {
                    address,
                    block_number,
                    transaction_hash: transaction_hash.clone(),
                    kind,
                })
            })
            .collect()
    }
}
