//! SmartTrade client core.
//!
//! Authenticated access to the SmartTrade gateway:
//! - `api`: the `ApiClient`, request descriptors and the `ErrorKind` taxonomy
//! - `auth`: credential storage, single-flight token refresh, cross-context
//!   session sync
//! - `config`: client configuration persisted under the user's config dir
//!
//! ```rust,ignore
//! let config = ClientConfig::load()?;
//! let origin = StorageOrigin::new(config.open_backend()?);
//! let client = ApiClient::new(&config, origin.open_context(&config.credentials_key))?;
//!
//! client.login("trader", "secret", true).await?;
//! let quotes: serde_json::Value = client.get("/services/stockservice/api/public/stocks").await?;
//! ```

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ErrorKind, RequestDescriptor};
pub use auth::{
    Credentials, CredentialStore, RefreshCoordinator, RefreshError, SessionSignal, StorageOrigin,
    TabSyncBroadcaster,
};
pub use config::ClientConfig;
