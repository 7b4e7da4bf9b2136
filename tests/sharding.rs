#![cfg(all(feature = "memory-store", feature = "memory-cache"))]

use futures::executor::block_on;
use rs_tenant_shard::{
    ConnectionStrings, DatabaseType, DistributedCacheExt, Error, MemoryCache, MemoryStore,
    ProcessLock, ReconcileOutcome, ShardingEntry, ShardingRegistryBuilder, TenantOptions,
    sharding_entry_key,
};

fn connections() -> ConnectionStrings {
    ConnectionStrings::new().with("Main", "Host=db;Port=5432;Database=main;Username=app")
}

fn entry(name: &str) -> ShardingEntry {
    ShardingEntry::new(name, "Main", DatabaseType::Postgres).with_database_name(name.to_lowercase())
}

#[test]
fn restarted_instance_should_restore_entries_from_the_backup() {
    let store = MemoryStore::new();
    let first = ShardingRegistryBuilder::new(store.clone(), MemoryCache::new(), connections())
        .lock(ProcessLock::new())
        .build();
    assert_eq!(block_on(first.reconcile_backup()).unwrap(), ReconcileOutcome::BothEmpty);
    block_on(first.add(entry("Shard1"))).unwrap();
    block_on(first.add(entry("Shard2"))).unwrap();

    // The cache was flushed; only the backup table survived.
    let restarted = ShardingRegistryBuilder::new(store, MemoryCache::new(), connections()).build();
    assert_eq!(
        block_on(restarted.reconcile_backup()).unwrap(),
        ReconcileOutcome::CacheRestored(2)
    );

    let names: Vec<String> = block_on(restarted.list())
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["Shard1", "Shard2"]);
    assert_eq!(
        block_on(restarted.connection_string("Shard2")).unwrap(),
        "Host=db;Port=5432;Username=app;Database=shard2"
    );
    assert_eq!(
        block_on(restarted.reconcile_backup()).unwrap(),
        ReconcileOutcome::InSync(2)
    );
}

#[test]
fn diverged_cache_should_be_reported_not_repaired() {
    let store = MemoryStore::new();
    let cache = MemoryCache::new();
    let registry = ShardingRegistryBuilder::new(store, cache.clone(), connections()).build();
    block_on(registry.add(entry("Shard1"))).unwrap();
    block_on(cache.set_class(&sharding_entry_key("Rogue"), &entry("Rogue"))).unwrap();

    let err = block_on(registry.reconcile_backup()).unwrap_err();

    let Error::Consistency(message) = err else {
        panic!("expected a consistency error");
    };
    assert!(message.contains("Rogue"));
    assert_eq!(block_on(registry.list()).unwrap().len(), 2);
}

#[test]
fn default_entry_should_be_listed_but_immutable() {
    let options = TenantOptions::single_level()
        .with_sharding()
        .with_default_entry(entry("Default"));
    let registry = ShardingRegistryBuilder::new(MemoryStore::new(), MemoryCache::new(), connections())
        .options(options)
        .build();
    block_on(registry.add(entry("Shard1"))).unwrap();

    let names: Vec<String> = block_on(registry.list())
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["Default", "Shard1"]);
    assert!(matches!(
        block_on(registry.update(entry("Default"))),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        block_on(registry.remove("Default")),
        Err(Error::Validation(_))
    ));
    assert_eq!(
        block_on(registry.reconcile_backup()).unwrap(),
        ReconcileOutcome::InSync(1)
    );
}
