//! Process-local handoff of table handles to co-resident clients.
//!
//! The connection handshake never ships a pointer across the wire: it
//! registers the table under a random token here and transmits the token.
//! A client living in the same process redeems the token with [`adopt`],
//! cloning the handle; the server [`release`]s its registration when the
//! handshake stream tears down.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rand::Rng;

use crate::table::Table;

fn registry() -> &'static Mutex<HashMap<u64, Arc<Table>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<Table>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register `table` and return the token a co-resident client redeems.
///
/// The token is random, nonzero and fits a signed 64-bit wire field.
pub fn register(table: Arc<Table>) -> u64 {
    let mut rng = rand::thread_rng();
    let mut registry = registry().lock();
    let mut token = rng.gen_range(1..=i64::MAX as u64);
    while registry.contains_key(&token) {
        token = rng.gen_range(1..=i64::MAX as u64);
    }
    registry.insert(token, table);
    token
}

/// Clone the handle registered under `token`, if it is still registered.
#[must_use]
pub fn adopt(token: u64) -> Option<Arc<Table>> {
    registry().lock().get(&token).cloned()
}

/// Drop the server-side registration for `token`.
pub fn release(token: u64) {
    registry().lock().remove(&token);
}
