use std::collections::HashMap;

use parking_lot::RwLock;

/// External credential-store boundary. The core validates credential
/// formats and forwards secrets to adapters; it never persists them
/// itself. Implementations live outside this crate (keychain, vault);
/// the in-memory store below exists for embedding and tests.
pub trait CredentialStore: Send + Sync {
    fn get_credential(&self, provider_id: &str) -> Option<String>;

    fn store_credential(
        &self,
        provider_id: &str,
        secret: &str,
        metadata: HashMap<String, String>,
    ) -> bool;
}

#[derive(Debug, Clone)]
struct StoredCredential {
    secret: String,
    #[allow(dead_code)]
    metadata: HashMap<String, String>,
}

/// Volatile credential store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, StoredCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get_credential(&self, provider_id: &str) -> Option<String> {
        self.entries
            .read()
            .get(provider_id)
            .map(|entry| entry.secret.clone())
    }

    fn store_credential(
        &self,
        provider_id: &str,
        secret: &str,
        metadata: HashMap<String, String>,
    ) -> bool {
        self.entries.write().insert(
            provider_id.to_string(),
            StoredCredential {
                secret: secret.to_string(),
                metadata,
            },
        );
        true
    }
}
