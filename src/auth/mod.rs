// Authentication module
// Manages the Google credential lifecycle for the signed-in principal

mod consent;
mod credentials;
mod manager;
mod provider;
mod refresh;
mod types;

pub use consent::ConsentBroker;
pub use credentials::{load_credential, save_credential, CredentialStore, MemoryStore, SqliteStore};
pub use manager::{CredentialManager, ManagerSettings};
pub use provider::{GoogleOAuth, GoogleOAuthSettings, OAuthProvider};
pub use refresh::ClientRegistration;
pub use types::{Credential, LifecycleState, LifecycleStatus, Principal, CREDENTIAL_KEY};
