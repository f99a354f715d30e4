use crate::types::{Address, Key, U256, Value};

/// A batch of state changes applied as one block by the archive.
///
/// Changes are applied in a fixed order so that a batch touching the same
/// account multiple ways stays deterministic: deletes, creates, balances,
/// nonces, codes, slots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    pub deleted_accounts: Vec<Address>,
    pub created_accounts: Vec<Address>,
    pub balances: Vec<(Address, U256)>,
    pub nonces: Vec<(Address, u64)>,
    pub codes: Vec<(Address, Vec<u8>)>,
    pub slots: Vec<(Address, Key, Value)>,
}

impl Update {
    pub fn delete_account(&mut self, address: Address) -> &mut Self {
        self.deleted_accounts.push(address);
        self
    }

    pub fn create_account(&mut self, address: Address) -> &mut Self {
        self.created_accounts.push(address);
        self
    }

    pub fn set_balance(&mut self, address: Address, balance: U256) -> &mut Self {
        self.balances.push((address, balance));
        self
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) -> &mut Self {
        self.nonces.push((address, nonce));
        self
    }

    pub fn set_code(&mut self, address: Address, code: Vec<u8>) -> &mut Self {
        self.codes.push((address, code));
        self
    }

    pub fn set_storage(&mut self, address: Address, key: Key, value: Value) -> &mut Self {
        self.slots.push((address, key, value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.deleted_accounts.is_empty()
            && self.created_accounts.is_empty()
            && self.balances.is_empty()
            && self.nonces.is_empty()
            && self.codes.is_empty()
            && self.slots.is_empty()
    }

    /// Sorts every change list and keeps the last write per target.
    pub fn normalize(&mut self) {
        self.deleted_accounts.sort_unstable();
        self.deleted_accounts.dedup();
        self.created_accounts.sort_unstable();
        self.created_accounts.dedup();
        dedup_last_wins(&mut self.balances, |(addr, _)| *addr);
        dedup_last_wins(&mut self.nonces, |(addr, _)| *addr);
        dedup_last_wins(&mut self.codes, |(addr, _)| *addr);
        dedup_last_wins(&mut self.slots, |(addr, key, _)| (*addr, *key));
    }
}

fn dedup_last_wins<T, K: Ord + Copy>(entries: &mut Vec<T>, key: impl Fn(&T) -> K) {
    // stable sort keeps in-batch write order per key, then keep the last
    entries.sort_by_key(&key);
    let mut deduped: Vec<T> = Vec::with_capacity(entries.len());
    for entry in entries.drain(..) {
        if let Some(last) = deduped.last() {
            if key(last) == key(&entry) {
                *deduped.last_mut().unwrap() = entry;
                continue;
            }
        }
        deduped.push(entry);
    }
    *entries = deduped;
}

#[cfg(test)]
mod test {
    use super::*;
    use ethereum_types::H256;

    fn addr(b: u8) -> Address {
        let mut a = Address::zero();
        a.0[0] = b;
        a
    }

    #[test]
    fn normalize_keeps_last_write_per_key() {
        let mut update = Update::default();
        update
            .set_balance(addr(1), U256::from(10))
            .set_balance(addr(2), U256::from(20))
            .set_balance(addr(1), U256::from(30));
        update.normalize();
        assert_eq!(
            update.balances,
            vec![(addr(1), U256::from(30)), (addr(2), U256::from(20))]
        );
    }

    #[test]
    fn normalize_dedups_slots_by_address_and_key() {
        let key = |b: u8| H256::repeat_byte(b);
        let mut update = Update::default();
        update
            .set_storage(addr(1), key(1), key(0xaa))
            .set_storage(addr(1), key(1), key(0xbb))
            .set_storage(addr(1), key(2), key(0xcc));
        update.normalize();
        assert_eq!(
            update.slots,
            vec![(addr(1), key(1), key(0xbb)), (addr(1), key(2), key(0xcc))]
        );
    }

    #[test]
    fn empty_update_is_empty() {
        assert!(Update::default().is_empty());
        let mut update = Update::default();
        update.create_account(addr(1));
        assert!(!update.is_empty());
    }
}
