//! Delta resolution: which records a client is missing for one artifact.
//!
//! Depth-first from the artifact's defining class chain and every fix-up
//! target, emitting in post-order so each record follows everything it
//! depends on. A record the client already knows is pruned together with its
//! subtree, since a client can only know a record after it knew that
//! record's dependencies. The compatibility header is sent with the artifact
//! itself and is never part of the delta.

use std::collections::HashSet;
use std::sync::Arc;

use aotc_error::{AotError, Result};
use aotc_types::{CompiledArtifact, KnownRecords, RecordKind, RecordRef, SerializationRecord};

struct Traversal<'a, F> {
    known: &'a KnownRecords,
    lookup: F,
    visited: HashSet<RecordRef>,
    out: Vec<Arc<SerializationRecord>>,
}

impl<F> Traversal<'_, F>
where
    F: Fn(RecordRef) -> Option<Arc<SerializationRecord>>,
{
    fn visit(&mut self, target: RecordRef) -> Result<()> {
        if self.known.contains(&target) || !self.visited.insert(target) {
            return Ok(());
        }
        let record = (self.lookup)(target).ok_or_else(|| {
            AotError::internal(format!("artifact refers to missing record {target}"))
        })?;
        for dep in record.dependencies() {
            self.visit(dep)?;
        }
        self.out.push(record);
        Ok(())
    }
}

/// Records reachable from `artifact` that are not in `known`, each exactly
/// once, dependencies first.
pub(crate) fn collect_delta<F>(
    artifact: &CompiledArtifact,
    known: &KnownRecords,
    lookup: F,
) -> Result<Vec<Arc<SerializationRecord>>>
where
    F: Fn(RecordRef) -> Option<Arc<SerializationRecord>>,
{
    let mut t = Traversal {
        known,
        lookup,
        visited: HashSet::new(),
        out: Vec::new(),
    };
    t.visit(RecordRef::new(
        RecordKind::ClassChain,
        artifact.key().defining_chain_id,
    ))?;
    for fixup in artifact.fixups() {
        if fixup.target.kind != RecordKind::AotHeader {
            t.visit(fixup.target)?;
        }
    }
    Ok(t.out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use aotc_types::{
        ArtifactKey, ClassChainRecord, ClassLoaderRecord, ClassRecord, ClassHash, Fixup,
        MethodRecord, OptLevel, RecordBody, RecordId,
    };

    use super::*;

    fn id(raw: u64) -> RecordId {
        RecordId::new(raw).unwrap()
    }

    fn add(map: &mut HashMap<RecordRef, Arc<SerializationRecord>>, raw: u64, body: RecordBody) {
        let record = Arc::new(SerializationRecord::new(id(raw), body));
        map.insert(record.record_ref(), record);
    }

    /// loader#1 <- class#1, class#2 <- chain#1 [1, 2]; method#1 on class#2.
    fn fixture() -> (
        HashMap<RecordRef, Arc<SerializationRecord>>,
        CompiledArtifact,
    ) {
        let mut m = HashMap::new();
        add(
            &mut m,
            1,
            RecordBody::ClassLoader(ClassLoaderRecord {
                first_class_name: "app/Main".to_owned(),
            }),
        );
        for (raw, name) in [(1, "app/Widget"), (2, "java/lang/Object")] {
            add(
                &mut m,
                raw,
                RecordBody::Class(ClassRecord {
                    class_loader_id: id(1),
                    hash: ClassHash::from_bytes([u8::try_from(raw).unwrap(); 32]),
                    canonical_size: 64,
                    name: name.to_owned(),
                }),
            );
        }
        add(
            &mut m,
            1,
            RecordBody::ClassChain(ClassChainRecord::new(vec![id(1), id(2)]).unwrap()),
        );
        add(
            &mut m,
            1,
            RecordBody::Method(MethodRecord {
                class_id: id(2),
                index: 0,
            }),
        );
        let artifact = CompiledArtifact::new(
            ArtifactKey {
                defining_chain_id: id(1),
                method_index: 0,
                opt_level: OptLevel::Hot,
                aot_header_id: id(1),
            },
            "app/Widget.run()V",
            vec![
                Fixup {
                    target: RecordRef::new(RecordKind::Method, id(1)),
                    offset: 0,
                },
                Fixup {
                    target: RecordRef::new(RecordKind::Class, id(1)),
                    offset: 8,
                },
            ],
            vec![0; 16],
        )
        .unwrap();
        (m, artifact)
    }

    #[test]
    fn test_delta_is_in_dependency_order() {
        let (map, artifact) = fixture();
        let delta = collect_delta(&artifact, &KnownRecords::new(), |r| map.get(&r).cloned())
            .unwrap();
        let refs: Vec<String> = delta.iter().map(|r| r.record_ref().to_string()).collect();
        assert_eq!(
            refs,
            vec![
                "class_loader#1",
                "class#1",
                "class#2",
                "class_chain#1",
                "method#1"
            ]
        );
    }

    #[test]
    fn test_known_records_are_pruned() {
        let (map, artifact) = fixture();
        let known: KnownRecords = [
            RecordRef::new(RecordKind::ClassLoader, id(1)),
            RecordRef::new(RecordKind::Class, id(1)),
            RecordRef::new(RecordKind::Class, id(2)),
        ]
        .into_iter()
        .collect();
        let delta = collect_delta(&artifact, &known, |r| map.get(&r).cloned()).unwrap();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0].kind(), RecordKind::ClassChain);
        assert_eq!(delta[1].kind(), RecordKind::Method);
    }

    #[test]
    fn test_missing_record_is_internal_error() {
        let (mut map, artifact) = fixture();
        map.remove(&RecordRef::new(RecordKind::Method, id(1)));
        let err = collect_delta(&artifact, &KnownRecords::new(), |r| map.get(&r).cloned())
            .unwrap_err();
        assert!(matches!(err, AotError::Internal(_)));
    }
}
