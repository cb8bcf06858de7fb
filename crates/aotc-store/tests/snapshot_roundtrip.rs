use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aotc_canon::ClassImageBuilder;
use aotc_error::AotError;
use aotc_store::{
    AotCache, AotCacheMap, MemoryBudget, SaveOutcome, SavePolicy, StoreConfig,
    read_snapshot_header,
};
use aotc_types::{
    ArtifactKey, CompatibilityDescriptor, CompiledArtifact, Fixup, KnownRecords, OptLevel,
    RecordKind,
};

fn config(dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        snapshot_dir: Some(dir.to_path_buf()),
        save_policy: SavePolicy {
            min_new_artifacts: 1,
            min_interval: Duration::ZERO,
        },
        ..StoreConfig::default()
    }
}

/// Store `methods` artifacts for one class into `cache`.
fn populate(cache: &AotCache, methods: u32) {
    let loader = cache.get_class_loader_record("app/Main").unwrap().unwrap();
    let mut builder = ClassImageBuilder::new("app/Main").superclass("java/lang/Object");
    for m in 0..methods {
        builder = builder.method(format!("m{m}"), "()V", 1, vec![0xB1], None);
    }
    let class = cache
        .get_class_record_for_image(loader.id(), &builder.build())
        .unwrap()
        .unwrap();
    let chain = cache.get_class_chain_record(&[class.id()]).unwrap().unwrap();
    let header = cache
        .get_aot_header_record(&CompatibilityDescriptor::default().encode())
        .unwrap()
        .unwrap();
    for m in 0..methods {
        let method = cache.get_method_record(class.id(), m).unwrap().unwrap();
        let artifact = CompiledArtifact::new(
            ArtifactKey {
                defining_chain_id: chain.id(),
                method_index: m,
                opt_level: OptLevel::Warm,
                aot_header_id: header.id(),
            },
            format!("app/Main.m{m}()V"),
            vec![Fixup {
                target: method.record_ref(),
                offset: 4,
            }],
            vec![0xAB; 16],
        )
        .unwrap();
        cache.store_artifact(artifact).unwrap().unwrap();
    }
}

#[test]
fn test_snapshot_round_trip_through_registry() {
    let dir = tempfile::tempdir().unwrap();
    let first = AotCacheMap::new(config(dir.path()), 100).unwrap();
    populate(&first.get_or_create("app"), 3);
    let saved = first.save_due(Instant::now());
    assert_eq!(saved.len(), 1);
    assert!(matches!(
        saved[0].1,
        Ok(SaveOutcome::Saved { artifacts: 3, .. })
    ));
    let original = first.get("app").unwrap();

    let second = AotCacheMap::new(config(dir.path()), 200).unwrap();
    let loaded = second.get_or_create("app");
    assert_eq!(loaded.server_uid(), 200);
    for kind in RecordKind::ALL {
        let a: Vec<_> = original.records(kind).iter().map(|r| r.identity()).collect();
        let b: Vec<_> = loaded.records(kind).iter().map(|r| r.identity()).collect();
        assert_eq!(a, b);
    }
    for artifact in original.artifacts() {
        let hit = loaded.find_artifact(artifact.key()).unwrap();
        assert_eq!(hit.payload(), artifact.payload());
        let delta = loaded.get_delta_records(&hit, &KnownRecords::new()).unwrap();
        assert_eq!(delta.len(), 4);
    }
    // A freshly loaded cache is not immediately due for another save.
    let eager = SavePolicy {
        min_new_artifacts: 1,
        min_interval: Duration::ZERO,
    };
    assert!(!loaded.should_save(&eager, Instant::now()));
}

#[test]
fn test_truncated_snapshot_is_rejected_wholesale() {
    let dir = tempfile::tempdir().unwrap();
    let map = AotCacheMap::new(config(dir.path()), 1).unwrap();
    populate(&map.get_or_create("app"), 2);
    map.save_all();
    let path = map.snapshot_path("app").unwrap();
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

    let budget = Arc::new(MemoryBudget::unlimited());
    let err = AotCache::load_snapshot(&path, "app", 2, Arc::clone(&budget)).unwrap_err();
    assert!(matches!(err, AotError::SnapshotCorrupt { .. }));
    assert_eq!(budget.used(), 0);

    // The registry falls back to an empty cache.
    let fresh = AotCacheMap::new(config(dir.path()), 2).unwrap();
    assert_eq!(fresh.get_or_create("app").total_record_count(), 0);
}

#[test]
fn test_missing_snapshot_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = AotCache::load_snapshot(
        &dir.path().join("absent.aotcache"),
        "absent",
        1,
        Arc::new(MemoryBudget::unlimited()),
    )
    .unwrap_err();
    assert!(matches!(err, AotError::SnapshotNotFound { .. }));
}

#[test]
fn test_smaller_store_does_not_replace_larger_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.aotcache");
    let budget = Arc::new(MemoryBudget::unlimited());

    let big = AotCache::new("shared", 1, Arc::clone(&budget));
    populate(&big, 3);
    let small = AotCache::new("shared", 2, Arc::clone(&budget));
    populate(&small, 1);

    assert!(matches!(
        big.save_snapshot(&path).unwrap(),
        SaveOutcome::Saved { artifacts: 3, .. }
    ));
    assert_eq!(
        small.save_snapshot(&path).unwrap(),
        SaveOutcome::Superseded {
            existing_artifacts: 3
        }
    );
    assert_eq!(read_snapshot_header(&path).unwrap().artifact_count, 3);
    // No temp files are left behind.
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}
