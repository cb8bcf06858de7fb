use aotc_canon::{
    ClassImage, ClassImageBuilder, StringOrder, canonical_size, canonicalize,
    canonicalize_checked, class_hash,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct MethodShape {
    name: String,
    signature: String,
    modifiers: u32,
    bytecode: Vec<u8>,
    debug: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct ClassShape {
    name: String,
    superclass: Option<String>,
    interfaces: Vec<String>,
    methods: Vec<MethodShape>,
    fields: Vec<(String, String)>,
    source_file: Option<String>,
}

impl ClassShape {
    fn builder(&self) -> ClassImageBuilder {
        let mut b = ClassImageBuilder::new(self.name.clone());
        if let Some(sup) = &self.superclass {
            b = b.superclass(sup.clone());
        }
        for iface in &self.interfaces {
            b = b.interface(iface.clone());
        }
        for m in &self.methods {
            b = b.method(
                m.name.clone(),
                m.signature.clone(),
                m.modifiers,
                m.bytecode.clone(),
                m.debug.clone(),
            );
        }
        for (name, sig) in &self.fields {
            b = b.field(name.clone(), sig.clone(), 0);
        }
        if let Some(src) = &self.source_file {
            b = b.source_file(src.clone());
        }
        b
    }
}

// A small vocabulary makes repeated strings likely, which is what exercises
// string sharing.
fn ident() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["run", "get", "value", "next", "<init>", "apply", "size"])
        .prop_map(str::to_owned)
}

fn type_name() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "java/lang/Object",
        "java/lang/Runnable",
        "app/Base",
        "app/Service",
        "java/util/List",
    ])
    .prop_map(str::to_owned)
}

fn descriptor() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["()V", "()I", "(I)V", "(Ljava/lang/Object;)Z", "I", "J"])
        .prop_map(str::to_owned)
}

fn method_shape() -> impl Strategy<Value = MethodShape> {
    (
        ident(),
        descriptor(),
        0_u32..16,
        prop::collection::vec(any::<u8>(), 1..12),
        prop::option::of(prop::collection::vec(any::<u8>(), 1..10)),
    )
        .prop_map(|(name, signature, modifiers, bytecode, debug)| MethodShape {
            name,
            signature,
            modifiers,
            bytecode,
            debug,
        })
}

fn class_shape() -> impl Strategy<Value = ClassShape> {
    (
        prop::sample::select(vec!["app/Widget", "app/Gadget", "app/Main$Inner"]),
        prop::option::of(type_name()),
        prop::collection::vec(type_name(), 0..3),
        prop::collection::vec(method_shape(), 0..5),
        prop::collection::vec((ident(), descriptor()), 0..4),
        prop::option::of(Just("Widget.java".to_owned())),
    )
        .prop_map(
            |(name, superclass, interfaces, methods, fields, source_file)| ClassShape {
                name: name.to_owned(),
                superclass,
                interfaces,
                methods,
                fields,
                source_file,
            },
        )
}

fn layout() -> impl Strategy<Value = (bool, StringOrder, bool)> {
    (
        any::<bool>(),
        prop::sample::select(vec![StringOrder::FirstUse, StringOrder::Reversed]),
        any::<bool>(),
    )
}

proptest! {
    #[test]
    fn prop_layout_does_not_affect_hash(shape in class_shape(), a in layout(), b in layout()) {
        let build = |(share, order, debug): (bool, StringOrder, bool)| {
            shape
                .builder()
                .share_strings(share)
                .string_order(order)
                .include_debug(debug)
                .build()
        };
        let left = canonicalize(&build(a)).unwrap();
        let right = canonicalize(&build(b)).unwrap();
        prop_assert_eq!(left.hash(), right.hash());
        prop_assert_eq!(left.bytes(), right.bytes());
    }

    #[test]
    fn prop_size_precheck_agrees_with_output(shape in class_shape(), opts in layout()) {
        let (share, order, debug) = opts;
        let image = shape
            .builder()
            .share_strings(share)
            .string_order(order)
            .include_debug(debug)
            .build();
        let size = canonical_size(&image).unwrap();
        let canonical = canonicalize_checked(&image, size).unwrap();
        prop_assert_eq!(canonical.len(), size);
        let reparsed = ClassImage::parse(canonical.bytes().to_vec()).unwrap();
        prop_assert_eq!(reparsed.name().unwrap(), shape.name.as_str());
        prop_assert_eq!(reparsed.methods().unwrap().len(), shape.methods.len());
    }

    #[test]
    fn prop_extra_method_changes_hash(shape in class_shape(), extra in method_shape()) {
        let base = class_hash(&shape.builder().build()).unwrap();
        let mut grown = shape.clone();
        grown.methods.push(extra);
        let other = class_hash(&grown.builder().build()).unwrap();
        prop_assert_ne!(base, other);
    }
}
