//! One-shot secret delivery.
//!
//! Job passwords live only in dispatcher RAM. A `DISPATCH` carries an opaque
//! reference; the worker redeems it with `FETCH_SECRET` on the same session,
//! and the dispatcher honors each reference exactly once, zeroing the bytes
//! on consumption.

use std::collections::HashMap;
use std::sync::Mutex;

use super::proto::ReqId;

/// A secret held in memory. Bytes are zeroed when the value drops.
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Secret(value.into())
    }

    fn into_string(mut self) -> Option<String> {
        let bytes = std::mem::take(&mut self.0);
        String::from_utf8(bytes).ok()
    }
}

impl Clone for Secret {
    fn clone(&self) -> Self {
        Secret(self.0.clone())
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Per-request secret registry with exactly-once redemption.
#[derive(Default)]
pub struct SecretStore {
    inner: Mutex<HashMap<ReqId, Secret>>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The opaque reference placed in a `DISPATCH` message.
    pub fn reference(req_id: ReqId) -> String {
        format!("ref-{:016x}", req_id)
    }

    pub fn register(&self, req_id: ReqId, secret: Secret) {
        self.inner
            .lock()
            .expect("secret store mutex poisoned")
            .insert(req_id, secret);
    }

    /// Redeem a reference. The first call returns the plaintext and removes
    /// the entry; later calls return `None`.
    pub fn fetch(&self, req_id: ReqId) -> Option<String> {
        self.inner
            .lock()
            .expect("secret store mutex poisoned")
            .remove(&req_id)
            .and_then(Secret::into_string)
    }

    /// Drop a secret that will never be fetched (task over, worker gone).
    pub fn discard(&self, req_id: ReqId) {
        self.inner
            .lock()
            .expect("secret store mutex poisoned")
            .remove(&req_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("secret store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
