//! HTTP implementation of the message API and vault transports (reqwest).
//!
//! Every request carries the identity headers (`X-Account-Token`,
//! `X-Account-Digest`, `X-Device-Id`); bodies already duplicate token and
//! digest where the server signs over them. Connection-level failures map
//! to `NetworkUnavailable`; rejections are decoded from the server's
//! `{ error, code }` body.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use sn_proto::api::*;
use sn_store::{vault::VaultTransport, Keyring, StoreError};

use crate::{
    error::{EngineError, ErrorKind},
    transport::MessageTransport,
};

#[derive(Clone)]
pub struct HttpApi {
    base_url: String,
    http: reqwest::Client,
    keyring: Keyring,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, keyring: Keyring) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::new(ErrorKind::Internal, e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
            keyring,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn identity(&self) -> Result<(String, String, String), EngineError> {
        Ok((
            self.keyring.account_token().await?,
            self.keyring.account_digest().await?.to_string(),
            self.keyring.device_id().await?,
        ))
    }

    /// Attach identity headers to a request builder.
    async fn with_identity(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, EngineError> {
        let (token, digest, device) = self.identity().await?;
        Ok(builder
            .header(HEADER_ACCOUNT_TOKEN, token)
            .header(HEADER_ACCOUNT_DIGEST, digest)
            .header(HEADER_DEVICE_ID, device))
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, EngineError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| EngineError::new(ErrorKind::Internal, e.to_string()));
        }
        Err(Self::rejection(status, response).await)
    }

    async fn rejection(status: StatusCode, response: reqwest::Response) -> EngineError {
        let body = response.text().await.unwrap_or_default();
        if let Ok(parsed) = serde_json::from_str::<ApiErrorResponse>(&body) {
            let kind = match parsed.code.as_str() {
                CODE_COUNTER_TOO_LOW => ErrorKind::CounterTooLow,
                _ => ErrorKind::Internal,
            };
            return EngineError::new(kind, format!("{} ({})", parsed.error, parsed.code));
        }
        EngineError::new(ErrorKind::Internal, format!("server returned {status}: {body}"))
    }

    fn network(e: reqwest::Error) -> EngineError {
        EngineError::network(e.to_string())
    }
}

#[async_trait]
impl MessageTransport for HttpApi {
    async fn sdm_exchange(
        &self,
        req: SdmExchangeRequest,
    ) -> Result<SdmExchangeResponse, EngineError> {
        // Pre-auth: the only call that goes out without identity headers.
        let resp = self
            .http
            .post(self.url("/auth/sdm/exchange"))
            .json(&req)
            .send()
            .await
            .map_err(Self::network)?;
        Self::read_json(resp).await
    }

    async fn publish_keys(
        &self,
        req: PublishKeysRequest,
    ) -> Result<PublishKeysResponse, EngineError> {
        let builder = self.http.post(self.url("/keys/publish")).json(&req);
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        Self::read_json(resp).await
    }

    async fn fetch_bundle(&self, req: BundleRequest) -> Result<BundleResponse, EngineError> {
        let builder = self.http.post(self.url("/keys/bundle")).json(&req);
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        Self::read_json(resp).await
    }

    async fn devkeys_store(&self, req: DevKeysStoreRequest) -> Result<(), EngineError> {
        let builder = self.http.post(self.url("/devkeys/store")).json(&req);
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::rejection(status, resp).await)
        }
    }

    async fn devkeys_fetch(&self) -> Result<DevKeysFetchResponse, EngineError> {
        let builder = self.http.post(self.url("/devkeys/fetch"));
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        Self::read_json(resp).await
    }

    async fn send_secure(&self, req: SendSecureRequest) -> Result<SendSecureResponse, EngineError> {
        let builder = self.http.post(self.url("/messages/secure")).json(&req);
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        Self::read_json(resp).await
    }

    async fn list_secure(&self, query: ListSecureQuery) -> Result<ListSecureResponse, EngineError> {
        let mut params: Vec<(&str, String)> = vec![
            ("conversationId", query.conversation_id.clone()),
            ("limit", query.limit.to_string()),
            ("includeKeys", query.include_keys.to_string()),
        ];
        if let Some(ts) = query.cursor_ts {
            params.push(("cursorTs", ts.to_rfc3339()));
        }
        if let Some(id) = query.cursor_id {
            params.push(("cursorId", id));
        }
        let builder = self.http.get(self.url("/messages/secure")).query(&params);
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        Self::read_json(resp).await
    }

    async fn get_by_counter(&self, query: ByCounterQuery) -> Result<Option<RawPacket>, EngineError> {
        let builder = self.http.get(self.url("/messages/by-counter")).query(&[
            ("conversationId", query.conversation_id.clone()),
            ("counter", query.counter.to_string()),
            ("senderDeviceId", query.sender_device_id.clone()),
        ]);
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read_json(resp).await.map(Some)
    }

    async fn max_counter(&self, query: MaxCounterQuery) -> Result<MaxCounterResponse, EngineError> {
        let builder = self
            .http
            .get(self.url("/messages/secure/max-counter"))
            .query(&[
                ("conversationId", query.conversation_id.clone()),
                ("senderDeviceId", query.sender_device_id.clone()),
            ]);
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        Self::read_json(resp).await
    }

    async fn contacts_uplink(&self, req: ContactsUplinkRequest) -> Result<(), EngineError> {
        let builder = self.http.post(self.url("/contacts/uplink")).json(&req);
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::rejection(status, resp).await)
        }
    }

    async fn contacts_downlink(&self) -> Result<ContactsDownlinkResponse, EngineError> {
        let builder = self.http.post(self.url("/contacts/downlink"));
        let resp = self
            .with_identity(builder)
            .await?
            .send()
            .await
            .map_err(Self::network)?;
        Self::read_json(resp).await
    }
}

// ── Vault half ───────────────────────────────────────────────────────────────

impl HttpApi {
    async fn vault_identity(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, StoreError> {
        self.with_identity(builder)
            .await
            .map_err(|e| StoreError::Rejected {
                code: e.kind.as_code(),
                message: e.message,
            })
    }

    async fn vault_json<T: DeserializeOwned>(
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<T, StoreError> {
        let resp = response.map_err(|e| StoreError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                code: status.to_string(),
                message: body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| StoreError::Rejected {
                code: "BAD_BODY".into(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl VaultTransport for HttpApi {
    async fn put(&self, req: VaultPutRequest) -> Result<VaultPutResponse, StoreError> {
        let builder = self.http.put(self.url("/message-key-vault")).json(&req);
        let builder = self.vault_identity(builder).await?;
        Self::vault_json(builder.send().await).await
    }

    async fn get(&self, req: VaultGetRequest) -> Result<VaultGetResponse, StoreError> {
        let builder = self.http.get(self.url("/message-key-vault")).query(&[
            ("conversationId", req.conversation_id.clone()),
            ("messageId", req.message_id.clone()),
            ("senderDeviceId", req.sender_device_id.clone()),
        ]);
        let builder = self.vault_identity(builder).await?;
        Self::vault_json(builder.send().await).await
    }

    async fn delete(&self, req: VaultGetRequest) -> Result<(), StoreError> {
        let builder = self.http.delete(self.url("/message-key-vault")).query(&[
            ("conversationId", req.conversation_id.clone()),
            ("messageId", req.message_id.clone()),
            ("senderDeviceId", req.sender_device_id.clone()),
        ]);
        let builder = self.vault_identity(builder).await?;
        let resp = builder
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Rejected {
                code: resp.status().to_string(),
                message: "vault delete rejected".into(),
            })
        }
    }

    async fn latest_state(
        &self,
        conversation_id: &str,
        sender_device_id: &str,
    ) -> Result<VaultLatestStateResponse, StoreError> {
        let builder = self
            .http
            .get(self.url("/message-key-vault/latest-state"))
            .query(&[
                ("conversationId", conversation_id.to_string()),
                ("senderDeviceId", sender_device_id.to_string()),
            ]);
        let builder = self.vault_identity(builder).await?;
        Self::vault_json(builder.send().await).await
    }
}
