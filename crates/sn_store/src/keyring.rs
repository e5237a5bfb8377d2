//! In-memory credential cell: Master Key, account identity, device keys.
//!
//! The Master Key lives in process memory only and is zeroized on lock.
//! Everything here is written once per unlock; the device private bundle may
//! arrive slightly later (after the remote backup fetch), so readers that
//! need it block on `wait_for_device_keys` and are woken by the writer.

use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use zeroize::ZeroizeOnDrop;

use sn_crypto::identity::{AccountDigest, DeviceKeyBundle};

use crate::error::StoreError;

#[derive(ZeroizeOnDrop)]
struct KeyringInner {
    mk: [u8; 32],
    #[zeroize(skip)]
    account_digest: AccountDigest,
    #[zeroize(skip)]
    account_token: String,
    #[zeroize(skip)]
    device_id: String,
}

/// Thread-safe credential handle. Clone to share across tasks.
#[derive(Clone)]
pub struct Keyring {
    inner: Arc<RwLock<Option<KeyringInner>>>,
    device_keys: Arc<RwLock<Option<DeviceKeyBundle>>>,
    device_keys_ready: Arc<Notify>,
}

impl Keyring {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            device_keys: Arc::new(RwLock::new(None)),
            device_keys_ready: Arc::new(Notify::new()),
        }
    }

    /// Install the unlocked credentials. Called once per unlock, before any
    /// pipeline work starts.
    pub async fn unlock(
        &self,
        mk: [u8; 32],
        account_digest: AccountDigest,
        account_token: String,
        device_id: String,
    ) {
        let mut guard = self.inner.write().await;
        *guard = Some(KeyringInner {
            mk,
            account_digest,
            account_token,
            device_id,
        });
    }

    /// Lock the session — zeroizes the MK and forgets the device keys.
    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
        let mut keys = self.device_keys.write().await;
        *keys = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Run `f` with the raw Master Key. Fails when locked.
    pub async fn with_mk<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => f(&inner.mk),
            None => Err(StoreError::Locked),
        }
    }

    /// Copy of the MK for a single operation. Prefer `with_mk`; this exists
    /// for call sites that must hold the key across an await point. The copy
    /// is zeroized by the caller via `Zeroizing`.
    pub async fn mk(&self) -> Result<zeroize::Zeroizing<[u8; 32]>, StoreError> {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => Ok(zeroize::Zeroizing::new(inner.mk)),
            None => Err(StoreError::Locked),
        }
    }

    pub async fn account_digest(&self) -> Result<AccountDigest, StoreError> {
        let guard = self.inner.read().await;
        guard
            .as_ref()
            .map(|i| i.account_digest.clone())
            .ok_or(StoreError::Locked)
    }

    pub async fn account_token(&self) -> Result<String, StoreError> {
        let guard = self.inner.read().await;
        guard
            .as_ref()
            .map(|i| i.account_token.clone())
            .ok_or(StoreError::Locked)
    }

    pub async fn device_id(&self) -> Result<String, StoreError> {
        let guard = self.inner.read().await;
        guard
            .as_ref()
            .map(|i| i.device_id.clone())
            .ok_or(StoreError::Locked)
    }

    // ── Device private bundle ────────────────────────────────────────────

    /// Install the device key bundle and wake every waiter.
    pub async fn set_device_keys(&self, bundle: DeviceKeyBundle) {
        let mut guard = self.device_keys.write().await;
        *guard = Some(bundle);
        self.device_keys_ready.notify_waiters();
    }

    pub async fn device_keys(&self) -> Option<DeviceKeyBundle> {
        self.device_keys.read().await.clone()
    }

    /// Mutate the bundle in place (OPK consumption, replenishment).
    pub async fn with_device_keys_mut<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut DeviceKeyBundle) -> R,
    {
        let mut guard = self.device_keys.write().await;
        match guard.as_mut() {
            Some(bundle) => Ok(f(bundle)),
            None => Err(StoreError::Locked),
        }
    }

    /// Block until the device bundle is available. Unlock writers call
    /// `set_device_keys`, which wakes everyone parked here.
    pub async fn wait_for_device_keys(&self) -> DeviceKeyBundle {
        loop {
            // Register interest before checking, so a concurrent writer
            // cannot slip between the check and the await.
            let notified = self.device_keys_ready.notified();
            if let Some(bundle) = self.device_keys().await {
                return bundle;
            }
            notified.await;
        }
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "00112233445566778899AABBCCDDEEFF00112233445566778899AABBCCDDEEFF";

    #[tokio::test]
    async fn locked_keyring_refuses_mk_access() {
        let keyring = Keyring::new();
        assert!(keyring.is_locked().await);
        assert!(matches!(
            keyring.with_mk(|_| Ok(())).await,
            Err(StoreError::Locked)
        ));
    }

    #[tokio::test]
    async fn unlock_then_lock_cycles() {
        let keyring = Keyring::new();
        keyring
            .unlock(
                [1u8; 32],
                AccountDigest::parse(DIGEST).unwrap(),
                "token".into(),
                "dev-1".into(),
            )
            .await;
        assert!(!keyring.is_locked().await);
        let copied = keyring.with_mk(|mk| Ok(*mk)).await.unwrap();
        assert_eq!(copied, [1u8; 32]);

        keyring.lock().await;
        assert!(keyring.is_locked().await);
    }

    #[tokio::test]
    async fn waiters_wake_when_device_keys_arrive() {
        let keyring = Keyring::new();
        let waiter = {
            let k = keyring.clone();
            tokio::spawn(async move { k.wait_for_device_keys().await })
        };
        // Give the waiter a chance to park first.
        tokio::task::yield_now().await;
        keyring
            .set_device_keys(sn_crypto::identity::DeviceKeyBundle::generate(1))
            .await;
        let bundle = waiter.await.unwrap();
        assert_eq!(bundle.opks.len(), 1);
    }
}
