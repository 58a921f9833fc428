//! Local contact cache: one JSON file per community under the data
//! directory, plus a one-time migration from the legacy single-file layout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const LEGACY_FILE: &str = "contacts-cache.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedContact {
    pub username: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub added_at: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub community: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    contacts: Vec<CachedContact>,
    last_updated: Option<String>,
}

pub struct ContactCache {
    data_dir: PathBuf,
    by_community: HashMap<String, Vec<CachedContact>>,
}

impl ContactCache {
    /// Opens the cache, running the legacy-file migration for
    /// `first_community` if applicable.
    pub fn new(data_dir: impl Into<PathBuf>, first_community: &str) -> io::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let cache = ContactCache {
            data_dir,
            by_community: HashMap::new(),
        };
        cache.migrate_legacy(first_community);
        Ok(cache)
    }

    pub fn file_path(&self, community: &str) -> PathBuf {
        self.data_dir
            .join(format!("contacts-cache-{community}.json"))
    }

    /// Move the legacy single-file cache into the first community's file.
    /// The legacy file is renamed to `*.migrated` either way; a corrupt one
    /// must never be parsed twice.
    fn migrate_legacy(&self, first_community: &str) {
        let legacy = self.data_dir.join(LEGACY_FILE);
        if !legacy.exists() || self.file_path(first_community).exists() {
            return;
        }

        if let Some(mut parsed) = read_cache_file(&legacy) {
            for contact in &mut parsed.contacts {
                contact.community = first_community.to_string();
            }
            let target = self.file_path(first_community);
            if let Ok(json) = serde_json::to_string_pretty(&parsed) {
                fs::write(&target, json).ok();
            }
        } else {
            eprintln!("⚠️  Corrupt legacy contact cache; discarding");
        }
        let migrated = legacy.with_extension("json.migrated");
        fs::rename(&legacy, &migrated).ok();
    }

    /// Contacts for a community, reading the file on first touch. A corrupt
    /// file counts as absent; the next successful store replaces it.
    pub fn contacts(&mut self, community: &str) -> &[CachedContact] {
        if !self.by_community.contains_key(community) {
            let loaded = read_cache_file(&self.file_path(community))
                .map(|f| f.contacts)
                .unwrap_or_default();
            self.by_community.insert(community.to_string(), loaded);
        }
        self.by_community.get(community).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&mut self, community: &str, username: &str) -> Option<CachedContact> {
        self.contacts(community)
            .iter()
            .find(|c| c.username == username)
            .cloned()
    }

    /// Replace a community's contacts and persist them.
    pub fn store(&mut self, community: &str, contacts: Vec<CachedContact>) -> io::Result<()> {
        self.by_community
            .insert(community.to_string(), contacts.clone());
        let file = CacheFile {
            contacts,
            last_updated: Some(chrono::Utc::now().to_rfc3339()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(self.file_path(community), json)
    }

    /// Write every in-memory community map back to disk.
    pub fn flush(&self) -> io::Result<()> {
        for (community, contacts) in &self.by_community {
            let file = CacheFile {
                contacts: contacts.clone(),
                last_updated: Some(chrono::Utc::now().to_rfc3339()),
            };
            let json = serde_json::to_string_pretty(&file)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            fs::write(self.file_path(community), json)?;
        }
        Ok(())
    }
}

fn read_cache_file(path: &Path) -> Option<CacheFile> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}
