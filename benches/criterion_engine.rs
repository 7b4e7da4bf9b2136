#![cfg(all(
    feature = "criterion-bench",
    feature = "memory-store",
    feature = "memory-cache"
))]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures::executor::block_on;
use rs_tenant_shard::{
    AuthUser, DatabaseType, DatabaseUsage, Decision, EngineBuilder, MemoryCache, MemoryStore,
    PackedPermissions, Permission, Role, RoleName, ShardingEntry, TenantOptions, UserId,
    pick_database,
};
use std::hint::black_box;
use std::time::Duration;

fn packed(codes: impl IntoIterator<Item = u16>) -> PackedPermissions {
    PackedPermissions::pack(codes.into_iter().map(|c| Permission::new(c).unwrap()))
}

/// A user holding `role_count` roles of 16 permissions each; the required
/// permission sits in the last role.
fn setup_store(role_count: u16) -> (MemoryStore, UserId, Permission) {
    let store = MemoryStore::new();
    let user = UserId::new("bench_user").unwrap();
    let mut auth_user = AuthUser::new(user.clone(), "bench@example.com");
    for i in 0..role_count {
        let name = RoleName::new(format!("role_{i}")).unwrap();
        store.add_role(Role::new(name.clone(), packed((i * 16 + 1)..=(i * 16 + 16))));
        auth_user.roles.push(name);
    }
    store.add_user(auth_user);
    let required = Permission::new(role_count * 16).unwrap();
    (store, user, required)
}

fn bench_authorize(c: &mut Criterion) {
    let mut group = c.benchmark_group("authorize");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    let (store, user, permission) = setup_store(4);
    let engine = EngineBuilder::new(store).build();
    group.bench_function("recompute_no_cache", |b| {
        b.iter(|| {
            let decision = block_on(engine.authorize(&user, permission)).unwrap();
            black_box(decision);
        });
    });

    let (store, user, permission) = setup_store(4);
    let engine = EngineBuilder::new(store).cache(MemoryCache::new()).build();
    assert_eq!(
        block_on(engine.authorize(&user, permission)).unwrap(),
        Decision::Allow
    );
    group.bench_function("hot_cache", |b| {
        b.iter(|| {
            let decision = block_on(engine.authorize(&user, permission)).unwrap();
            black_box(decision);
        });
    });

    let (store, user, permission) = setup_store(4);
    let engine = EngineBuilder::new(store)
        .cache(MemoryCache::new().with_ttl(Duration::from_secs(60)))
        .build();
    assert_eq!(
        block_on(engine.authorize(&user, permission)).unwrap(),
        Decision::Allow
    );
    group.bench_function("hot_cache_with_ttl", |b| {
        b.iter(|| {
            let decision = block_on(engine.authorize(&user, permission)).unwrap();
            black_box(decision);
        });
    });

    group.finish();
}

fn bench_role_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("authorize_role_fanout");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    for role_count in [1u16, 8, 32, 128] {
        let (store, user, required) = setup_store(role_count);
        let engine = EngineBuilder::new(store).build();

        let id = BenchmarkId::from_parameter(role_count);
        group.bench_with_input(id, &role_count, |b, _| {
            b.iter(|| {
                let decision = block_on(engine.authorize(&user, required)).unwrap();
                black_box(decision);
            });
        });
    }

    group.finish();
}

fn bench_packed(c: &mut Criterion) {
    let mut group = c.benchmark_group("packed_permissions");
    group.sample_size(30);

    let sets: Vec<PackedPermissions> = (0..32u16)
        .map(|i| packed((i * 16 + 1)..=(i * 16 + 16)))
        .collect();
    group.bench_function("union_32_roles", |b| {
        b.iter(|| black_box(PackedPermissions::union(sets.iter())));
    });

    let all = PackedPermissions::union(sets.iter());
    let last = Permission::new(512).unwrap();
    let missing = Permission::new(4_000).unwrap();
    group.bench_function("grants_hit", |b| b.iter(|| black_box(all.grants(last))));
    group.bench_function("grants_miss", |b| b.iter(|| black_box(all.grants(missing))));

    group.finish();
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("pick_database");
    group.sample_size(30);

    let options = TenantOptions::single_level().with_sharding();
    for count in [10usize, 100, 1_000] {
        let entries: Vec<ShardingEntry> = (0..count)
            .map(|i| ShardingEntry::new(format!("db_{i:04}"), "Server", DatabaseType::Postgres))
            .collect();
        let usage: Vec<DatabaseUsage> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| DatabaseUsage {
                database_info_name: entry.name.clone(),
                tenant_count: i % 40,
                has_own_db_tenant: false,
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("shared", count), &count, |b, _| {
            b.iter(|| black_box(pick_database(&entries, &usage, false, None, &options).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_authorize,
    bench_role_fanout,
    bench_packed,
    bench_select
);
criterion_main!(benches);
