// master/src/roster.rs

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use common::{lock, ClientProfile, SharedProfile};
use tracing::info;

/// Perfiles de las máquinas conocidas. Se leen una vez al arrancar y no se
/// escriben; las estadísticas que se acumulan viven en memoria.
pub struct Roster {
    profiles: Vec<SharedProfile>,
    in_use: Mutex<HashSet<String>>,
}

impl Roster {
    pub fn new(profiles: Vec<ClientProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| Arc::new(Mutex::new(p)))
                .collect(),
            in_use: Mutex::new(HashSet::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Lista JSON de perfiles.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("no se pudo leer el roster {}", path.display()))?;
        let profiles: Vec<ClientProfile> = serde_json::from_str(&raw)
            .with_context(|| format!("roster inválido en {}", path.display()))?;

        for profile in &profiles {
            let mut check = profile.clone();
            check
                .set_tunnel_port(profile.tunnel_port())
                .with_context(|| format!("perfil {}", profile.hostname))?;
        }

        info!("roster con {} perfiles", profiles.len());
        Ok(Self::new(profiles))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn find(&self, hostname: &str) -> Option<SharedProfile> {
        self.profiles
            .iter()
            .find(|p| lock(p).hostname == hostname)
            .cloned()
    }

    /// Perfiles que no tienen un worker asociado.
    pub fn available(&self) -> Vec<SharedProfile> {
        let in_use = lock(&self.in_use);
        self.profiles
            .iter()
            .filter(|p| !in_use.contains(&lock(p).hostname))
            .cloned()
            .collect()
    }

    pub fn mark_in_use(&self, hostname: &str) -> bool {
        lock(&self.in_use).insert(hostname.to_string())
    }

    pub fn release(&self, hostname: &str) {
        lock(&self.in_use).remove(hostname);
    }
}
