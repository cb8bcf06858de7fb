use std::collections::HashSet;
use std::sync::Arc;

use aotc_canon::ClassImageBuilder;
use aotc_store::{AotCache, MemoryBudget};
use aotc_types::{
    ArtifactKey, CompatibilityDescriptor, CompiledArtifact, Fixup, KnownRecords, OptLevel,
    RecordId, RecordKind, RecordRef,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct ArtifactShape {
    chain: Vec<usize>,
    class_fixups: Vec<usize>,
    method_fixups: Vec<(usize, u32)>,
}

fn artifact_shape(classes: usize) -> impl Strategy<Value = ArtifactShape> {
    (
        prop::collection::vec(0..classes, 1..4),
        prop::collection::vec(0..classes, 0..3),
        prop::collection::vec((0..classes, 0_u32..3), 0..3),
    )
        .prop_map(|(chain, class_fixups, method_fixups)| ArtifactShape {
            chain,
            class_fixups,
            method_fixups,
        })
}

struct World {
    cache: AotCache,
    classes: Vec<RecordId>,
    header: RecordId,
}

fn world(classes: usize) -> World {
    let cache = AotCache::new("prop", 1, Arc::new(MemoryBudget::unlimited()));
    let loaders: Vec<RecordId> = (0..2)
        .map(|l| {
            cache
                .get_class_loader_record(&format!("app/Boot{l}"))
                .unwrap()
                .unwrap()
                .id()
        })
        .collect();
    let classes = (0..classes)
        .map(|c| {
            let image = ClassImageBuilder::new(format!("app/C{c}")).build();
            cache
                .get_class_record_for_image(loaders[c % 2], &image)
                .unwrap()
                .unwrap()
                .id()
        })
        .collect();
    let header = cache
        .get_aot_header_record(&CompatibilityDescriptor::default().encode())
        .unwrap()
        .unwrap()
        .id();
    World {
        cache,
        classes,
        header,
    }
}

fn build(w: &World, shape: &ArtifactShape, method_index: u32) -> CompiledArtifact {
    let chain_ids: Vec<RecordId> = shape.chain.iter().map(|c| w.classes[*c]).collect();
    let chain = w.cache.get_class_chain_record(&chain_ids).unwrap().unwrap();
    let mut fixups: Vec<Fixup> = shape
        .class_fixups
        .iter()
        .map(|c| Fixup {
            target: RecordRef::new(RecordKind::Class, w.classes[*c]),
            offset: 0,
        })
        .collect();
    for (c, m) in &shape.method_fixups {
        let method = w.cache.get_method_record(w.classes[*c], *m).unwrap().unwrap();
        fixups.push(Fixup {
            target: method.record_ref(),
            offset: 0,
        });
    }
    fixups.push(Fixup {
        target: RecordRef::new(RecordKind::AotHeader, w.header),
        offset: 0,
    });
    CompiledArtifact::new(
        ArtifactKey {
            defining_chain_id: chain.id(),
            method_index,
            opt_level: OptLevel::Hot,
            aot_header_id: w.header,
        },
        "app/C.m()V",
        fixups,
        vec![0; 8],
    )
    .unwrap()
}

proptest! {
    #[test]
    fn prop_delta_is_ordered_and_complete(
        first in artifact_shape(6),
        second in artifact_shape(6),
    ) {
        let w = world(6);
        let a = build(&w, &first, 0);
        let b = build(&w, &second, 1);

        // The client learned everything needed for `a` first.
        let mut known = KnownRecords::new();
        for record in w.cache.get_delta_records(&a, &known).unwrap() {
            known.insert(record.record_ref());
        }

        let delta = w.cache.get_delta_records(&b, &known).unwrap();
        let mut have = known.clone();
        let mut emitted = HashSet::new();
        for record in &delta {
            prop_assert!(!known.contains(&record.record_ref()));
            prop_assert!(emitted.insert(record.record_ref()), "emitted twice");
            prop_assert_ne!(record.kind(), RecordKind::AotHeader);
            for dep in record.dependencies() {
                prop_assert!(have.contains(&dep), "{} before {}", record.record_ref(), dep);
            }
            have.insert(record.record_ref());
        }

        // Every record the artifact needs, except the header, is now present.
        let chain = RecordRef::new(RecordKind::ClassChain, b.key().defining_chain_id);
        prop_assert!(have.contains(&chain));
        for fixup in b.fixups() {
            if fixup.target.kind != RecordKind::AotHeader {
                prop_assert!(have.contains(&fixup.target));
            }
        }
    }
}
