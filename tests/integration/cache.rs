use cc4me::sdk::cache::{CachedContact, ContactCache};
use std::path::PathBuf;

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!(
            "cc4me_cache_{}",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        TempDir(dir)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn contact(name: &str, community: &str) -> CachedContact {
    CachedContact {
        username: name.to_string(),
        public_key: Some(format!("pk-{name}")),
        endpoint: Some(format!("http://{name}.example/inbox")),
        added_at: chrono::Utc::now().to_rfc3339(),
        online: false,
        last_seen: None,
        community: community.to_string(),
    }
}

#[test]
fn test_store_and_reload() {
    let dir = TempDir::new();
    {
        let mut cache = ContactCache::new(&dir.0, "home").unwrap();
        cache
            .store("home", vec![contact("bob", "home"), contact("carol", "home")])
            .unwrap();
    }

    // A fresh instance reads the per-community file back.
    let mut cache = ContactCache::new(&dir.0, "home").unwrap();
    let bob = cache.get("home", "bob").unwrap();
    assert_eq!(bob.public_key.as_deref(), Some("pk-bob"));
    assert_eq!(cache.contacts("home").len(), 2);
    assert!(dir.0.join("contacts-cache-home.json").exists());
}

#[test]
fn test_communities_are_separate_files() {
    let dir = TempDir::new();
    let mut cache = ContactCache::new(&dir.0, "home").unwrap();
    cache.store("home", vec![contact("bob", "home")]).unwrap();
    cache.store("work", vec![contact("dan", "work")]).unwrap();

    assert!(dir.0.join("contacts-cache-home.json").exists());
    assert!(dir.0.join("contacts-cache-work.json").exists());
    assert!(cache.get("home", "dan").is_none());
    assert!(cache.get("work", "dan").is_some());
}

#[test]
fn test_legacy_file_migration() {
    let dir = TempDir::new();
    let legacy = serde_json::json!({
        "contacts": [
            { "username": "bob", "publicKey": "pk-bob", "addedAt": "2025-01-01T00:00:00+00:00" }
        ],
        "lastUpdated": "2025-01-01T00:00:00+00:00"
    });
    std::fs::write(
        dir.0.join("contacts-cache.json"),
        serde_json::to_string(&legacy).unwrap(),
    )
    .unwrap();

    let mut cache = ContactCache::new(&dir.0, "home").unwrap();

    // Contents moved into the first community's file, stamped with it.
    let bob = cache.get("home", "bob").unwrap();
    assert_eq!(bob.community, "home");
    assert_eq!(bob.public_key.as_deref(), Some("pk-bob"));

    // Legacy file renamed so it is never parsed again.
    assert!(!dir.0.join("contacts-cache.json").exists());
    assert!(dir.0.join("contacts-cache.json.migrated").exists());
}

#[test]
fn test_legacy_migration_skipped_when_community_file_exists() {
    let dir = TempDir::new();
    {
        let mut cache = ContactCache::new(&dir.0, "home").unwrap();
        cache.store("home", vec![contact("carol", "home")]).unwrap();
    }
    std::fs::write(
        dir.0.join("contacts-cache.json"),
        r#"{"contacts":[{"username":"bob","addedAt":"x"}]}"#,
    )
    .unwrap();

    let mut cache = ContactCache::new(&dir.0, "home").unwrap();
    // The existing per-community file wins; the legacy file is untouched.
    assert!(cache.get("home", "bob").is_none());
    assert!(cache.get("home", "carol").is_some());
    assert!(dir.0.join("contacts-cache.json").exists());
}

#[test]
fn test_corrupt_legacy_file_renamed_not_parsed() {
    let dir = TempDir::new();
    std::fs::write(dir.0.join("contacts-cache.json"), "{not json").unwrap();

    let mut cache = ContactCache::new(&dir.0, "home").unwrap();
    assert!(cache.contacts("home").is_empty());
    assert!(!dir.0.join("contacts-cache.json").exists());
    assert!(dir.0.join("contacts-cache.json.migrated").exists());
}

#[test]
fn test_corrupt_community_file_treated_as_absent() {
    let dir = TempDir::new();
    std::fs::write(dir.0.join("contacts-cache-home.json"), "][").unwrap();

    let mut cache = ContactCache::new(&dir.0, "home").unwrap();
    assert!(cache.contacts("home").is_empty());

    // The next successful store replaces it.
    cache.store("home", vec![contact("bob", "home")]).unwrap();
    let mut fresh = ContactCache::new(&dir.0, "home").unwrap();
    assert!(fresh.get("home", "bob").is_some());
}

#[test]
fn test_flush_writes_all_communities() {
    let dir = TempDir::new();
    let mut cache = ContactCache::new(&dir.0, "home").unwrap();
    cache.store("home", vec![contact("bob", "home")]).unwrap();

    // Wipe the files, then flush the in-memory state back out.
    std::fs::remove_file(dir.0.join("contacts-cache-home.json")).unwrap();
    cache.flush().unwrap();
    assert!(dir.0.join("contacts-cache-home.json").exists());
}
