//! Property-based tests over the value model, the pack mini-language,
//! the frame codec and canonical type forms.

use std::sync::{Arc, OnceLock};

use proptest::prelude::*;

use ferry::typing::serialize;
use ferry::{PackArg, Registry, Slot, Value};

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::null()),
        any::<bool>().prop_map(Value::boolean),
        any::<i64>().prop_map(Value::int64),
        any::<u64>().prop_map(Value::uint64),
        any::<f64>()
            .prop_filter("finite doubles only", |f| f.is_finite())
            .prop_map(Value::double),
        any::<i64>().prop_map(Value::date),
        "[ -~]{0,24}".prop_map(Value::string),
        prop::collection::vec(any::<u8>(), 0..48)
            .prop_map(|b| Value::binary(bytes::Bytes::from(b))),
    ]
}

fn arb_value() -> impl Strategy<Value = Value> {
    arb_scalar().prop_recursive(3, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::array),
            prop::collection::hash_map("[a-z0-9]{1,8}", inner, 0..6)
                .prop_map(Value::dictionary_from),
        ]
    })
}

fn shared_registry() -> Arc<Registry> {
    static REGISTRY: OnceLock<Arc<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(
                dir.path().join("geom.json"),
                r#"{
                    "module": "geom",
                    "struct Map<K,V>": {"members": {"entries": "array", "default": "V"}}
                }"#,
            )
            .unwrap();
            let registry = Registry::new();
            registry.load_dir(dir.path()).unwrap();
            Arc::new(registry)
        })
        .clone()
}

#[derive(Clone, Debug)]
enum Scalar {
    B(bool),
    I(i64),
    U(u64),
    D(f64),
    S(String),
}

impl Scalar {
    fn token(&self) -> char {
        match self {
            Scalar::B(_) => 'b',
            Scalar::I(_) => 'i',
            Scalar::U(_) => 'u',
            Scalar::D(_) => 'd',
            Scalar::S(_) => 's',
        }
    }

    fn arg(&self) -> PackArg {
        match self {
            Scalar::B(v) => PackArg::Bool(*v),
            Scalar::I(v) => PackArg::Int(*v),
            Scalar::U(v) => PackArg::Uint(*v),
            Scalar::D(v) => PackArg::Double(*v),
            Scalar::S(v) => PackArg::Str(v.clone()),
        }
    }
}

fn arb_scalar_token() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        any::<bool>().prop_map(Scalar::B),
        any::<i64>().prop_map(Scalar::I),
        any::<u64>().prop_map(Scalar::U),
        any::<f64>()
            .prop_filter("finite doubles only", |f| f.is_finite())
            .prop_map(Scalar::D),
        "[a-z]{0,12}".prop_map(Scalar::S),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Deep copy preserves both the structural hash and strict equality.
    #[test]
    fn prop_copy_determinism(v in arb_value()) {
        let copy = v.deep_copy().unwrap();
        prop_assert_eq!(copy.hash(), v.hash());
        prop_assert_eq!(copy, v);
    }

    /// The frame codec inverts itself on descriptor-free graphs.
    #[test]
    fn prop_codec_round_trip(v in arb_value()) {
        let (payload, fds) = ferry::codec::encode(&v).unwrap();
        prop_assert!(fds.is_empty());
        let back = ferry::codec::decode(&payload, fds).unwrap();
        prop_assert_eq!(back, v);
    }

    /// Tagged serialisation is the identity on untyped graphs, and
    /// deserialisation inverts it.
    #[test]
    fn prop_serialize_untyped_identity(v in arb_value()) {
        let wire = serialize(&v);
        prop_assert_eq!(&wire, &v);
        let back = shared_registry().deserialize(&wire).unwrap();
        prop_assert_eq!(back, v);
    }

    /// Packing scalars into an array and unpacking with the same format
    /// recovers every argument exactly.
    #[test]
    fn prop_pack_unpack_scalar_round_trip(scalars in prop::collection::vec(arb_scalar_token(), 1..8)) {
        let tokens: Vec<String> = scalars.iter().map(|s| s.token().to_string()).collect();
        let fmt = format!("[{}]", tokens.join(","));
        let args: Vec<PackArg> = scalars.iter().map(Scalar::arg).collect();

        let packed = Value::pack(&fmt, args).unwrap();
        prop_assert_eq!(packed.array_len(), scalars.len());

        for (index, scalar) in scalars.iter().enumerate() {
            let element = packed.array_get(index).unwrap();
            match scalar {
                Scalar::B(expected) => {
                    let mut out = false;
                    element.unpack("b", &mut [Slot::Bool(&mut out)]).unwrap();
                    prop_assert_eq!(out, *expected);
                }
                Scalar::I(expected) => {
                    let mut out = 0i64;
                    element.unpack("i", &mut [Slot::Int(&mut out)]).unwrap();
                    prop_assert_eq!(out, *expected);
                }
                Scalar::U(expected) => {
                    let mut out = 0u64;
                    element.unpack("u", &mut [Slot::Uint(&mut out)]).unwrap();
                    prop_assert_eq!(out, *expected);
                }
                Scalar::D(expected) => {
                    let mut out = 0f64;
                    element.unpack("d", &mut [Slot::Double(&mut out)]).unwrap();
                    prop_assert_eq!(out, *expected);
                }
                Scalar::S(expected) => {
                    let mut out = String::new();
                    element.unpack("s", &mut [Slot::Str(&mut out)]).unwrap();
                    prop_assert_eq!(&out, expected);
                }
            }
        }
    }

    /// A string value and a binary value over the same bytes hash equal.
    #[test]
    fn prop_string_binary_hash_agree(text in "[ -~]{0,32}") {
        let string = Value::string(text.clone());
        let binary = Value::binary(bytes::Bytes::from(text.into_bytes()));
        prop_assert_eq!(string.hash(), binary.hash());
    }

    /// Canonical forms are whitespace-insensitive and stable.
    #[test]
    fn prop_canonical_form_ignores_whitespace(
        ws1 in " {0,3}", ws2 in " {0,3}", ws3 in " {0,3}",
    ) {
        let registry = shared_registry();
        let decl = format!("geom.Map<{}string,{}double{}>", ws1, ws2, ws3);
        let typei = registry.new_typei(&decl).unwrap();
        prop_assert_eq!(typei.canonical_form(), "geom.Map<string,double>");
    }

    /// Hash equality of containers is order-independent.
    #[test]
    fn prop_array_hash_order_independent(values in prop::collection::vec(arb_scalar(), 0..8)) {
        let forward = Value::array(values.clone());
        let mut reversed_items = values;
        reversed_items.reverse();
        let reversed = Value::array(reversed_items);
        prop_assert_eq!(forward.hash(), reversed.hash());
    }
}
