use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aotc::{
    AotCacheClient, AotCacheResponse, AotCacheServer, ClassDescriptor, CompileContext,
    MethodDescriptor, Result,
};
use aotc_canon::{ClassImage, ClassImageBuilder};
use aotc_client::{
    AotDeserializer, ClassHandle, ClassRuntime, DeserializerConfig, InMemoryDurableStore,
    InMemoryResolver, SimulatedRuntime,
};
use aotc_store::{SavePolicy, StoreConfig};
use aotc_types::encoding::read_u64_le;
use aotc_types::{CompiledArtifact, Fixup, OptLevel, RecordId, RecordKind, RecordRef};

const SIGNATURE: &str = "app/Widget.run()V";

fn widget_image(body: u8) -> ClassImage {
    ClassImageBuilder::new("app/Widget")
        .superclass("java/lang/Object")
        .method("run", "()V", 1, vec![body, 0xB1], None)
        .build()
}

fn describe(image: &ClassImage) -> MethodDescriptor {
    MethodDescriptor {
        chain: vec![ClassDescriptor {
            loader_first_class: "app/Widget".to_owned(),
            image: image.clone(),
        }],
        method_index: 0,
        opt_level: OptLevel::Warm,
        signature: SIGNATURE.to_owned(),
    }
}

/// Code for `run` that refers to its method, its class and the header.
fn compile_run(ctx: &CompileContext<'_>) -> Result<Option<CompiledArtifact>> {
    let class_id = ctx.class_ids[0];
    let Some(method) = ctx.cache.get_method_record(class_id, 0)? else {
        return Ok(None);
    };
    let fixups = vec![
        Fixup {
            target: method.record_ref(),
            offset: 0,
        },
        Fixup {
            target: RecordRef::new(RecordKind::Class, class_id),
            offset: 8,
        },
        Fixup {
            target: RecordRef::new(RecordKind::AotHeader, ctx.key.aot_header_id),
            offset: 16,
        },
    ];
    CompiledArtifact::new(ctx.key, SIGNATURE, fixups, vec![0xCC; 32]).map(Some)
}

fn compile(server: &AotCacheServer, runtime: &SimulatedRuntime, image: &ClassImage) {
    server
        .store_compiled("app", &describe(image), &runtime.compatibility_header(), compile_run)
        .unwrap()
        .unwrap();
}

struct Jvm {
    runtime: Arc<SimulatedRuntime>,
    class: ClassHandle,
    client: AotCacheClient<SimulatedRuntime, InMemoryResolver>,
}

fn jvm(client_id: u64, image: &ClassImage) -> Jvm {
    let runtime = Arc::new(SimulatedRuntime::new());
    let loader = runtime.define_loader();
    let class = runtime.define_class(loader, image.clone(), &[]).unwrap();
    let client = AotCacheClient::new(
        AotDeserializer::new(Arc::clone(&runtime), InMemoryResolver),
        client_id,
        "app",
    );
    Jvm {
        runtime,
        class,
        client,
    }
}

fn decode_cell(code: &[u8], offset: usize) -> Option<RecordRef> {
    InMemoryResolver::decode(read_u64_le(code, offset)?)
}

fn id(raw: u64) -> RecordId {
    RecordId::new(raw).unwrap()
}

#[test]
fn test_hit_then_incremental_delta() {
    let image = widget_image(0x2A);
    let server = AotCacheServer::with_server_uid(StoreConfig::default(), 11).unwrap();
    let jvm = jvm(7, &image);
    let method = describe(&image);

    assert!(jvm.client.fetch(&server, &method).unwrap().is_none());
    compile(&server, &jvm.runtime, &image);

    let installed = jvm.client.fetch(&server, &method).unwrap().unwrap();
    assert_eq!(
        decode_cell(&installed.code, 0),
        Some(RecordRef::new(RecordKind::Method, id(1)))
    );
    assert_eq!(
        decode_cell(&installed.code, 8),
        Some(RecordRef::new(RecordKind::Class, id(1)))
    );
    assert_eq!(
        decode_cell(&installed.code, 16),
        Some(RecordRef::new(RecordKind::AotHeader, id(1)))
    );
    assert_eq!(&installed.code[24..], &[0xCC; 8]);
    assert_eq!(jvm.client.installed(SIGNATURE), Some(installed.clone()));
    // Loader, class, chain and method.
    assert_eq!(server.statistics().snapshot().records_sent, 4);

    // The second request acknowledges them; nothing is re-sent.
    let again = jvm.client.fetch(&server, &method).unwrap().unwrap();
    assert_eq!(again.code, installed.code);
    let stats = server.statistics().snapshot();
    assert_eq!((stats.hits, stats.misses, stats.records_sent), (2, 1, 4));
    assert_eq!(server.client_session(7).unwrap().known_count(), 4);
}

#[test]
fn test_server_restart_from_snapshot_resets_client() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        snapshot_dir: Some(dir.path().to_path_buf()),
        save_policy: SavePolicy {
            min_new_artifacts: 1,
            min_interval: Duration::ZERO,
        },
        ..StoreConfig::default()
    };
    let image = widget_image(0x2A);
    let jvm = jvm(7, &image);
    let method = describe(&image);

    let first = AotCacheServer::with_server_uid(config.clone(), 1).unwrap();
    compile(&first, &jvm.runtime, &image);
    jvm.client.fetch(&first, &method).unwrap().unwrap();
    let saved = first.persist_due();
    assert_eq!(saved.len(), 1);
    assert!(saved[0].1.is_ok());
    drop(first);

    let second = AotCacheServer::with_server_uid(config, 2).unwrap();
    let installed = jvm.client.fetch(&second, &method).unwrap().unwrap();
    assert_eq!(installed.generation, 1);
    assert_eq!(jvm.client.deserializer().generation(), 1);
    assert_eq!(second.cached_methods("app"), vec![SIGNATURE.to_owned()]);
    // A fresh session gets everything again.
    assert_eq!(second.statistics().snapshot().records_sent, 4);

    // The next request carries the reset and the re-cached ids.
    jvm.client.fetch(&second, &method).unwrap().unwrap();
    assert_eq!(second.statistics().snapshot().records_sent, 4);
    assert_eq!(second.client_session(7).unwrap().known_count(), 4);
}

#[test]
fn test_redefined_class_misses_until_recompiled() {
    let v1 = widget_image(0x2A);
    let v2 = widget_image(0x2B);
    let server = AotCacheServer::with_server_uid(StoreConfig::default(), 3).unwrap();
    let jvm = jvm(7, &v1);
    compile(&server, &jvm.runtime, &v1);
    let first = jvm.client.fetch(&server, &describe(&v1)).unwrap().unwrap();

    let replacement = jvm.runtime.redefine_class(jvm.class, v2.clone()).unwrap();
    jvm.client.deserializer().on_class_redefined(jvm.class);
    assert_ne!(replacement, jvm.class);

    assert!(jvm.client.fetch(&server, &describe(&v2)).unwrap().is_none());
    compile(&server, &jvm.runtime, &v2);
    let second = jvm.client.fetch(&server, &describe(&v2)).unwrap().unwrap();
    assert_ne!(first.code[..16], second.code[..16]);
    // The loader was already known: class, chain and method only.
    assert_eq!(server.statistics().snapshot().records_sent, 4 + 3);
    assert_eq!(server.cached_methods("app").len(), 2);
}

#[test]
fn test_exhausted_budget_answers_unavailable() {
    let image = widget_image(0x2A);
    let server = AotCacheServer::with_server_uid(
        StoreConfig {
            memory_budget_bytes: 1,
            ..StoreConfig::default()
        },
        4,
    )
    .unwrap();
    let jvm = jvm(7, &image);

    let request = jvm.client.request(describe(&image));
    let response = server.handle(&request).unwrap();
    assert!(matches!(response, AotCacheResponse::Unavailable { server_uid: 4, .. }));
    assert!(jvm.client.handle_response(&response).unwrap().is_none());

    let stored = server
        .store_compiled(
            "app",
            &describe(&image),
            &jvm.runtime.compatibility_header(),
            compile_run,
        )
        .unwrap();
    assert!(stored.is_none());
    assert_eq!(server.statistics().snapshot().unavailable, 1);
}

#[test]
fn test_durable_store_client_from_config() {
    let image = widget_image(0x2A);
    let server = AotCacheServer::with_server_uid(StoreConfig::default(), 5).unwrap();
    let runtime = Arc::new(SimulatedRuntime::new());
    let loader = runtime.define_loader();
    runtime.define_class(loader, image.clone(), &[]).unwrap();
    let store = Arc::new(InMemoryDurableStore::new(16));
    let client = AotCacheClient::from_config(
        Arc::clone(&runtime),
        Some(Arc::clone(&store)),
        &DeserializerConfig::default(),
        9,
        "app",
    )
    .unwrap();
    compile(&server, &runtime, &image);

    let installed = client.fetch(&server, &describe(&image)).unwrap().unwrap();
    // Method, class and header each got a slot.
    assert_eq!(store.len(), 3);
    let mut cells: Vec<u64> = (0..3)
        .map(|i| read_u64_le(&installed.code, i * 8).unwrap())
        .collect();
    cells.sort_unstable();
    assert_eq!(cells, vec![0, 8, 16]);
}

#[test]
fn test_report_json() {
    let image = widget_image(0x2A);
    let server = AotCacheServer::with_server_uid(StoreConfig::default(), 6).unwrap();
    let jvm = jvm(7, &image);
    compile(&server, &jvm.runtime, &image);
    jvm.client.fetch(&server, &describe(&image)).unwrap().unwrap();

    let report: serde_json::Value = serde_json::from_str(&server.report_json().unwrap()).unwrap();
    assert_eq!(report["server_uid"], 6);
    assert_eq!(report["sessions"], 1);
    assert_eq!(report["server"]["hits"], 1);
    assert_eq!(report["shared_classes"]["entries"], 1);
    assert_eq!(report["caches"][0]["name"], "app");
    assert_eq!(report["caches"][0]["artifacts"], 1);
    assert!(report["budget_used"].as_u64().unwrap() > 0);
}

#[test]
fn test_concurrent_clients_share_one_server() {
    let image = widget_image(0x2A);
    let server = AotCacheServer::with_server_uid(StoreConfig::default(), 8).unwrap();
    {
        let seed = jvm(0, &image);
        compile(&server, &seed.runtime, &image);
    }
    thread::scope(|s| {
        for client_id in 1..=4 {
            let (server, image) = (&server, &image);
            s.spawn(move || {
                let jvm = jvm(client_id, image);
                let method = describe(image);
                for _ in 0..25 {
                    assert!(jvm.client.fetch(server, &method).unwrap().is_some());
                }
                assert_eq!(server.client_session(client_id).unwrap().known_count(), 4);
            });
        }
    });
    let stats = server.statistics().snapshot();
    assert_eq!(stats.hits, 100);
    assert_eq!(stats.records_sent, 16);
    assert_eq!(server.session_count(), 4);
    assert_eq!(server.caches().shared_classes().len(), 1);
}
