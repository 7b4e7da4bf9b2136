#![cfg(all(feature = "memory-store", feature = "memory-cache"))]

use futures::executor::block_on;
use rs_tenant_shard::{
    AuthUser, DatabaseType, DatabaseUsage, Decision, EngineBuilder, IsolationLevel, MemoryCache,
    MemoryStore, NewTenant, PackedPermissions, Permission, Role, RoleName, RoleType,
    ShardingEntry, StoreTransaction, TenantOptions, TenantType, Transactional, UserId,
    pick_database,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

const REPEATS: usize = 5;

fn report(name: &str, samples: &mut [std::time::Duration], ops: usize, detail: &str) {
    samples.sort_unstable();
    let median = samples[REPEATS / 2];
    let total_ms = median.as_secs_f64() * 1_000.0;
    let ns_per_op = median.as_secs_f64() * 1_000_000_000.0 / ops as f64;
    let ops_per_sec = ops as f64 / median.as_secs_f64();
    println!(
        "{name}: median={total_ms:.3} ms, ns/op={ns_per_op:.1}, ops/s={ops_per_sec:.0} ({detail}, repeats={REPEATS})"
    );
}

fn benchmark_sync<F>(name: &str, iterations: usize, mut op: F)
where
    F: FnMut(),
{
    let mut samples = Vec::with_capacity(REPEATS);
    for _ in 0..REPEATS {
        let start = Instant::now();
        for _ in 0..iterations {
            op();
        }
        samples.push(start.elapsed());
    }
    report(name, &mut samples, iterations, &format!("iters={iterations}"));
}

fn benchmark_parallel<F>(name: &str, threads: usize, iterations_per_thread: usize, op_factory: F)
where
    F: Fn() -> Box<dyn FnMut() + Send> + Send + Sync + 'static,
{
    let op_factory = Arc::new(op_factory);
    let mut samples = Vec::with_capacity(REPEATS);
    for _ in 0..REPEATS {
        let start = Instant::now();
        let joins: Vec<_> = (0..threads)
            .map(|_| {
                let factory = Arc::clone(&op_factory);
                std::thread::spawn(move || {
                    let mut op = factory();
                    for _ in 0..iterations_per_thread {
                        op();
                    }
                })
            })
            .collect();
        for join in joins {
            join.join().expect("thread panicked");
        }
        samples.push(start.elapsed());
    }
    let total_ops = threads * iterations_per_thread;
    report(
        name,
        &mut samples,
        total_ops,
        &format!("threads={threads}, total_ops={total_ops}"),
    );
}

fn packed(codes: impl IntoIterator<Item = u16>) -> PackedPermissions {
    PackedPermissions::pack(codes.into_iter().map(|c| Permission::new(c).unwrap()))
}

/// A user holding `role_count` roles of 20 permissions each, in a tenant
/// carrying one auto-add role.
fn setup_store(role_count: u16) -> (MemoryStore, UserId) {
    let store = MemoryStore::new();
    let user = UserId::new("perf_user").unwrap();
    let mut auth_user = AuthUser::new(user.clone(), "perf@example.com");
    for i in 0..role_count {
        let name = RoleName::new(format!("role_{i}")).unwrap();
        store.add_role(Role::new(name.clone(), packed((i * 20 + 1)..=(i * 20 + 20))));
        auth_user.roles.push(name);
    }
    let auto = RoleName::new("tenant_auto").unwrap();
    store.add_role(Role::new(auto.clone(), packed([999])).with_type(RoleType::TenantAutoAdd));

    let mut tx = block_on(store.begin(IsolationLevel::ReadCommitted)).unwrap();
    let tenant = block_on(tx.insert_tenant(NewTenant {
        full_name: "Perf".to_string(),
        parent_id: None,
        is_hierarchical: false,
        database_info_name: None,
        has_own_db: false,
        tenant_roles: vec![auto],
    }))
    .unwrap();
    block_on(tx.commit()).unwrap();
    store.add_user(auth_user.in_tenant(tenant.id));
    (store, user)
}

#[test]
#[ignore = "manual performance test; run with --ignored --nocapture"]
fn perf_authorize_and_select() {
    let iterations = 200_000;
    let permission = Permission::new(15).unwrap();

    let (store, user) = setup_store(10);
    let engine = EngineBuilder::new(store)
        .tenant_type(TenantType::SingleLevel)
        .build();
    benchmark_sync("authorize_recompute_no_cache", iterations / 10, || {
        let result = block_on(engine.authorize(&user, permission)).unwrap();
        black_box(result);
    });

    let (store, user) = setup_store(10);
    let engine = EngineBuilder::new(store)
        .cache(MemoryCache::new())
        .tenant_type(TenantType::SingleLevel)
        .build();
    let warm = block_on(engine.authorize(&user, permission)).unwrap();
    assert_eq!(warm, Decision::Allow);
    benchmark_sync("authorize_hot_cache", iterations, || {
        let result = block_on(engine.authorize(&user, permission)).unwrap();
        black_box(result);
    });

    let threads = std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(4);
    let engine = Arc::new(engine);
    let engine_for_parallel = Arc::clone(&engine);
    benchmark_parallel("authorize_hot_cache_parallel", threads, 50_000, move || {
        let engine = Arc::clone(&engine_for_parallel);
        let user = user.clone();
        Box::new(move || {
            let result = block_on(engine.authorize(&user, permission)).unwrap();
            black_box(result);
        })
    });

    let entries: Vec<ShardingEntry> = (0..1_000)
        .map(|i| ShardingEntry::new(format!("db_{i:04}"), "Server", DatabaseType::Postgres))
        .collect();
    let usage: Vec<DatabaseUsage> = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| DatabaseUsage {
            database_info_name: entry.name.clone(),
            tenant_count: i % 50,
            has_own_db_tenant: i % 97 == 0,
        })
        .collect();
    let options = TenantOptions::single_level().with_sharding();
    benchmark_sync("pick_database_1000_entries", iterations / 100, || {
        let chosen = pick_database(&entries, &usage, false, None, &options).unwrap();
        black_box(chosen);
    });
}
