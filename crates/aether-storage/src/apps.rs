// Installed-app registry
//
// Apps are named bundles a user installs against the kernel (dashboards,
// automations). The kernel only tracks identity, ownership, and the enabled
// flag; the manifest is opaque JSON for the client side.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use aether_core::{KernelError, KvStore, Result};

const NS_APPS: &str = "apps";

/// One installed app
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    pub owner_uid: String,
    pub enabled: bool,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub manifest: Value,
}

/// App repository
#[derive(Clone)]
pub struct AppStore {
    kv: Arc<dyn KvStore>,
}

impl AppStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Install an app for a user; enabled by default
    pub async fn install(&self, name: &str, owner_uid: &str, manifest: Value) -> Result<App> {
        if name.trim().is_empty() {
            return Err(KernelError::invalid("app name must not be empty"));
        }
        let app = App {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            owner_uid: owner_uid.to_string(),
            enabled: true,
            installed_at: Utc::now(),
            manifest,
        };
        self.persist(&app).await?;
        Ok(app)
    }

    pub async fn get(&self, id: &str) -> Result<Option<App>> {
        match self.kv.get(NS_APPS, id).await? {
            Some(value) => Ok(Some(
                serde_json::from_value(value).map_err(|e| KernelError::storage(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Apps owned by one user
    pub async fn list_for(&self, owner_uid: &str) -> Result<Vec<App>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|app| app.owner_uid == owner_uid)
            .collect())
    }

    /// Every installed app (admin view)
    pub async fn list_all(&self) -> Result<Vec<App>> {
        self.kv
            .list(NS_APPS)
            .await?
            .into_iter()
            .map(|(_, value)| {
                serde_json::from_value(value).map_err(|e| KernelError::storage(e.to_string()))
            })
            .collect()
    }

    /// Flip the enabled flag
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<App> {
        let mut app = self
            .get(id)
            .await?
            .ok_or_else(|| KernelError::invalid(format!("no such app: {id}")))?;
        app.enabled = enabled;
        self.persist(&app).await?;
        Ok(app)
    }

    /// Remove an app; returns whether it existed
    pub async fn uninstall(&self, id: &str) -> Result<bool> {
        self.kv.delete(NS_APPS, id).await
    }

    async fn persist(&self, app: &App) -> Result<()> {
        let value = serde_json::to_value(app).map_err(|e| KernelError::storage(e.to_string()))?;
        self.kv.put(NS_APPS, &app.id, value).await
    }
}
