use crate::domain::models::CalendarIntegration;
use crate::infrastructure::error::InfraError;
use std::collections::HashMap;
use std::sync::Mutex;

pub const DEFAULT_SERVICE_NAME: &str = "taskcal.google-calendar";

/// Per-user calendar integration records, including the OAuth token.
pub trait IntegrationStore: Send + Sync {
    fn save(&self, integration: &CalendarIntegration) -> Result<(), InfraError>;
    fn load(&self, user_id: &str) -> Result<Option<CalendarIntegration>, InfraError>;
    fn delete(&self, user_id: &str) -> Result<(), InfraError>;
}

/// Keeps each user's integration as a JSON secret in the OS keyring.
#[derive(Debug, Clone)]
pub struct KeyringIntegrationStore {
    service_name: String,
}

impl KeyringIntegrationStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, user_id: &str) -> Result<keyring::Entry, InfraError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(InfraError::Credential("user id must not be empty".to_string()));
        }
        keyring::Entry::new(&self.service_name, user_id)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringIntegrationStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl IntegrationStore for KeyringIntegrationStore {
    fn save(&self, integration: &CalendarIntegration) -> Result<(), InfraError> {
        let payload = serde_json::to_string(integration)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        self.entry(&integration.user_id)?
            .set_password(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load(&self, user_id: &str) -> Result<Option<CalendarIntegration>, InfraError> {
        let payload = match self.entry(user_id)?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(error) => return Err(InfraError::Credential(error.to_string())),
        };

        let integration = serde_json::from_str::<CalendarIntegration>(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        Ok(Some(integration))
    }

    fn delete(&self, user_id: &str) -> Result<(), InfraError> {
        match self.entry(user_id)?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryIntegrationStore {
    integrations: Mutex<HashMap<String, CalendarIntegration>>,
}

impl InMemoryIntegrationStore {
    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, CalendarIntegration>>, InfraError> {
        self.integrations
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))
    }
}

impl IntegrationStore for InMemoryIntegrationStore {
    fn save(&self, integration: &CalendarIntegration) -> Result<(), InfraError> {
        self.lock()?
            .insert(integration.user_id.clone(), integration.clone());
        Ok(())
    }

    fn load(&self, user_id: &str) -> Result<Option<CalendarIntegration>, InfraError> {
        Ok(self.lock()?.get(user_id).cloned())
    }

    fn delete(&self, user_id: &str) -> Result<(), InfraError> {
        self.lock()?.remove(user_id);
        Ok(())
    }
}
