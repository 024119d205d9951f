//! Application, release and artifact metadata.
//!
//! The dispatcher only reads from the catalog. [`MemoryCatalog`] keeps
//! everything in memory and can be seeded from a JSON file at startup:
//!
//! ```json
//! {
//!   "apps":      [{"id": "app1", "name": "web"}],
//!   "artifacts": [{"id": "art1", "type": "docker", "uri": "docker://alpine"}],
//!   "releases":  [{"id": "rel1", "artifactID": "art1", "env": {"PORT": "80"}}]
//! }
//! ```

pub mod image;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub use image::ImageRef;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("invalid image URI {uri:?}: {reason}")]
    InvalidImage { uri: String, reason: String },

    #[error("failed to load catalog: {0}")]
    Load(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    #[serde(rename = "artifactID")]
    pub artifact_id: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub uri: String,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn app(&self, id: &str) -> Result<App, CatalogError>;

    async fn release(&self, id: &str) -> Result<Release, CatalogError>;

    async fn artifact(&self, id: &str) -> Result<Artifact, CatalogError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Seed {
    #[serde(default)]
    apps: Vec<App>,
    #[serde(default)]
    releases: Vec<Release>,
    #[serde(default)]
    artifacts: Vec<Artifact>,
}

#[derive(Debug, Default)]
struct Tables {
    apps: HashMap<String, App>,
    releases: HashMap<String, Release>,
    artifacts: HashMap<String, Artifact>,
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: RwLock<Tables>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load_file(path: &Path) -> Result<Self, CatalogError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| CatalogError::Load(format!("{}: {}", path.display(), e)))?;
        let catalog = Self::from_json(&data)?;
        {
            let tables = catalog.tables.read().await;
            tracing::info!(
                path = %path.display(),
                apps = tables.apps.len(),
                releases = tables.releases.len(),
                artifacts = tables.artifacts.len(),
                "Catalog loaded"
            );
        }
        Ok(catalog)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, CatalogError> {
        let seed: Seed =
            serde_json::from_slice(data).map_err(|e| CatalogError::Load(e.to_string()))?;
        let tables = Tables {
            apps: seed.apps.into_iter().map(|a| (a.id.clone(), a)).collect(),
            releases: seed
                .releases
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            artifacts: seed
                .artifacts
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
        };
        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    pub async fn put_app(&self, app: App) {
        self.tables.write().await.apps.insert(app.id.clone(), app);
    }

    pub async fn put_release(&self, release: Release) {
        self.tables
            .write()
            .await
            .releases
            .insert(release.id.clone(), release);
    }

    pub async fn put_artifact(&self, artifact: Artifact) {
        self.tables
            .write()
            .await
            .artifacts
            .insert(artifact.id.clone(), artifact);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn app(&self, id: &str) -> Result<App, CatalogError> {
        self.tables
            .read()
            .await
            .apps
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::AppNotFound(id.to_string()))
    }

    async fn release(&self, id: &str) -> Result<Release, CatalogError> {
        self.tables
            .read()
            .await
            .releases
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::ReleaseNotFound(id.to_string()))
    }

    async fn artifact(&self, id: &str) -> Result<Artifact, CatalogError> {
        self.tables
            .read()
            .await
            .artifacts
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::ArtifactNotFound(id.to_string()))
    }
}
