//! Message API transport trait.
//!
//! The engine talks to the server exclusively through this interface so the
//! whole pipeline runs against in-memory fakes in tests. The HTTP
//! implementation lives in `client`; the vault half of the server is the
//! separate `sn_store::vault::VaultTransport` trait (one server, two
//! concerns).

use async_trait::async_trait;

use sn_proto::api::*;

use crate::error::EngineError;

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn sdm_exchange(&self, req: SdmExchangeRequest) -> Result<SdmExchangeResponse, EngineError>;

    async fn publish_keys(&self, req: PublishKeysRequest) -> Result<PublishKeysResponse, EngineError>;
    async fn fetch_bundle(&self, req: BundleRequest) -> Result<BundleResponse, EngineError>;

    async fn devkeys_store(&self, req: DevKeysStoreRequest) -> Result<(), EngineError>;
    async fn devkeys_fetch(&self) -> Result<DevKeysFetchResponse, EngineError>;

    async fn send_secure(&self, req: SendSecureRequest) -> Result<SendSecureResponse, EngineError>;
    async fn list_secure(&self, query: ListSecureQuery) -> Result<ListSecureResponse, EngineError>;
    async fn get_by_counter(&self, query: ByCounterQuery) -> Result<Option<RawPacket>, EngineError>;
    async fn max_counter(&self, query: MaxCounterQuery) -> Result<MaxCounterResponse, EngineError>;

    async fn contacts_uplink(&self, req: ContactsUplinkRequest) -> Result<(), EngineError>;
    async fn contacts_downlink(&self) -> Result<ContactsDownlinkResponse, EngineError>;
}
