//! Account/device bootstrap: credential exchange, Master Key derivation,
//! device key provisioning and the wrapped server-side backup.
//!
//! The Master Key is derived at unlock from the one-shot credential
//! exchange plus the account token (`HKDF(mk_seed, account_token, "mk/v1")`)
//! and never leaves process memory. When the server already holds a wrapped
//! MK copy, that copy wins — the derived key only unwraps it.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine};

use sn_crypto::envelope::{self, INFO_BACKUP};
use sn_crypto::identity::{AccountDigest, DeviceKeyBundle};
use sn_crypto::kdf;
use sn_proto::api::{
    DevKeysStoreRequest, OpkUpload, PublishKeysRequest, SdmExchangeRequest,
};

use crate::{
    error::{EngineError, ErrorKind},
    session::Session,
};

/// Fresh batches and the replenish threshold for one-time prekeys.
pub const OPK_BATCH: u32 = 20;
pub const OPK_LOW_WATER: u32 = 10;

// ── Unlock ───────────────────────────────────────────────────────────────────

/// Exchange the physical credential for account identity and install the
/// Master Key. Stage 0 of every session.
pub async fn unlock(session: &Arc<Session>, req: SdmExchangeRequest) -> Result<(), EngineError> {
    let resp = session.api.sdm_exchange(req).await?;
    let digest = AccountDigest::parse(&resp.account_digest).map_err(EngineError::from)?;

    let seed = B64
        .decode(&resp.mk_seed_b64)
        .map_err(|e| EngineError::new(ErrorKind::Internal, e.to_string()))?;
    let seed_key =
        kdf::derive_master_key(&seed, &resp.account_token).map_err(EngineError::from)?;

    let mk = match &resp.wrapped_mk {
        Some(wrapped) => {
            let raw = envelope::decrypt(wrapped, &seed_key, &[INFO_BACKUP])
                .map_err(EngineError::from)?;
            raw.as_slice().try_into().map_err(|_| {
                EngineError::new(ErrorKind::Internal, "wrapped MK is not 32 bytes")
            })?
        }
        None => seed_key,
    };

    let device_id = match &session.cache {
        Some(cache) => match cache.device_id().await.map_err(EngineError::from)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                cache.set_device_id(&id).await.map_err(EngineError::from)?;
                id
            }
        },
        None => uuid::Uuid::new_v4().to_string(),
    };

    session
        .keyring
        .unlock(mk, digest.clone(), resp.account_token.clone(), device_id.clone())
        .await;

    tracing::info!(
        target: "sn_engine",
        event = "unlocked",
        digest = %digest,
        device_id = %device_id
    );
    Ok(())
}

// ── Device keys ──────────────────────────────────────────────────────────────

/// Fetch the wrapped device-key backup, or generate, publish and back up a
/// fresh bundle on first run. Wakes every `wait_for_device_keys` parker.
pub async fn ensure_device_keys(session: &Arc<Session>) -> Result<(), EngineError> {
    if session.keyring.device_keys().await.is_some() {
        return Ok(());
    }

    let master_key = session.keyring.mk().await?;
    let fetched = session.api.devkeys_fetch().await?;

    if let Some(wrapped) = fetched.wrapped_dev {
        let bundle = DeviceKeyBundle::unwrap(&wrapped, &master_key).map_err(EngineError::from)?;
        session.keyring.set_device_keys(bundle).await;
        tracing::info!(target: "sn_engine", event = "device_keys_restored");
        return Ok(());
    }

    let bundle = DeviceKeyBundle::generate(OPK_BATCH);
    let unused = publish_bundle(session, &bundle, bundle_opk_uploads(&bundle)).await?;
    store_wrapped(session, &bundle, &master_key).await?;
    session.keyring.set_device_keys(bundle).await;
    tracing::info!(
        target: "sn_engine",
        event = "device_keys_provisioned",
        unused_opks = unused
    );
    Ok(())
}

fn bundle_opk_uploads(bundle: &DeviceKeyBundle) -> Vec<OpkUpload> {
    bundle
        .opks
        .iter()
        .map(|o| OpkUpload {
            id: o.id,
            pub_b64: o.public_b64(),
        })
        .collect()
}

async fn publish_bundle(
    session: &Arc<Session>,
    bundle: &DeviceKeyBundle,
    opks: Vec<OpkUpload>,
) -> Result<u32, EngineError> {
    let resp = session
        .api
        .publish_keys(PublishKeysRequest {
            account_token: session.keyring.account_token().await?,
            account_digest: session.keyring.account_digest().await?.to_string(),
            ik_pub: bundle.ik_public_b64(),
            spk_pub: bundle.spk_public_b64(),
            spk_sig: bundle.spk_sig_b64(),
            opks,
        })
        .await?;
    Ok(resp.unused_opk_count)
}

async fn store_wrapped(
    session: &Arc<Session>,
    bundle: &DeviceKeyBundle,
    master_key: &[u8; 32],
) -> Result<(), EngineError> {
    let wrapped = bundle.wrap(master_key).map_err(EngineError::from)?;
    session
        .api
        .devkeys_store(DevKeysStoreRequest {
            account_token: session.keyring.account_token().await?,
            account_digest: session.keyring.account_digest().await?.to_string(),
            wrapped_dev: wrapped,
        })
        .await
}

/// Top up the server-side OPK pool when it runs low. Publishes only the new
/// batch and refreshes the wrapped backup (the bundle gained secrets).
pub async fn replenish_opks_if_low(
    session: &Arc<Session>,
    unused_opk_count: u32,
) -> Result<bool, EngineError> {
    if unused_opk_count >= OPK_LOW_WATER {
        return Ok(false);
    }

    let new_batch = session
        .keyring
        .with_device_keys_mut(|b| {
            b.replenish_opks(OPK_BATCH)
                .into_iter()
                .map(|(id, pub_b64)| OpkUpload { id, pub_b64 })
                .collect::<Vec<_>>()
        })
        .await?;

    let bundle = session
        .keyring
        .device_keys()
        .await
        .ok_or_else(|| EngineError::identity_missing("device key bundle"))?;
    publish_bundle(session, &bundle, new_batch).await?;

    let master_key = session.keyring.mk().await?;
    store_wrapped(session, &bundle, &master_key).await?;

    tracing::info!(target: "sn_engine", event = "opks_replenished", batch = OPK_BATCH);
    Ok(true)
}
