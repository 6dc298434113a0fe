//! Runtime validation of values against declared types, and the tagged
//! serialisation that carries canonical type forms across a connection.

use crate::error::Error;
use crate::value::{Kind, Value};

use super::{Registry, Type, TypeClass, TypeInstance, TYPE_FIELD, VALUE_FIELD};

/// One validation failure, anchored at a member path like `.y` or `[3]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    /// Renders the violation as a value for error replies.
    pub fn to_value(&self) -> Value {
        Value::dictionary_from([
            ("path", Value::string(&self.path)),
            ("message", Value::string(&self.message)),
        ])
    }
}

impl Registry {
    /// Validates `value` against `typei`, accumulating every violation
    /// instead of stopping at the first.
    pub fn validate(&self, typei: &TypeInstance, value: &Value) -> Vec<Violation> {
        let mut out = Vec::new();
        self.validate_at(typei, value, "", &mut out);
        out
    }

    /// True iff [`Registry::validate`] reports no violations.
    pub fn is_valid(&self, typei: &TypeInstance, value: &Value) -> bool {
        self.validate(typei, value).is_empty()
    }

    fn validate_at(
        &self,
        typei: &TypeInstance,
        value: &Value,
        path: &str,
        out: &mut Vec<Violation>,
    ) {
        // An unbound generic variable accepts any object.
        if typei.is_variable() {
            return;
        }

        let ty = match self.type_by_name(typei.type_name()) {
            Some(ty) => ty,
            None => {
                out.push(Violation {
                    path: path.to_string(),
                    message: format!("unknown type '{}'", typei.type_name()),
                });
                return;
            }
        };

        match ty.class() {
            TypeClass::Builtin => self.validate_builtin(&ty, value, path, out),
            TypeClass::Typedef => {
                let definition = match ty.definition() {
                    Some(d) => d,
                    None => {
                        out.push(Violation {
                            path: path.to_string(),
                            message: format!("typedef '{}' has no definition", ty.full_name()),
                        });
                        return;
                    }
                };
                let resolved = self.substitute(definition, &ty, typei);
                self.validate_at(&resolved, value, path, out);
            }
            TypeClass::Enum => {
                let member = value.as_str();
                let ok = member
                    .map(|name| ty.members().iter().any(|m| m.name() == name))
                    .unwrap_or(false);
                if !ok {
                    out.push(Violation {
                        path: path.to_string(),
                        message: format!(
                            "expected one of the {} members of enum '{}'",
                            ty.members().len(),
                            ty.full_name()
                        ),
                    });
                }
            }
            TypeClass::Struct => self.validate_struct(&ty, typei, value, path, out),
            TypeClass::Union => self.validate_union(&ty, typei, value, path, out),
        }
    }

    fn validate_builtin(&self, ty: &Type, value: &Value, path: &str, out: &mut Vec<Violation>) {
        let name = ty.name();
        if name == "any" {
            return;
        }
        if value.kind_name() != name {
            out.push(Violation {
                path: path.to_string(),
                message: format!("expected {}, got {}", name, value.kind_name()),
            });
        }
    }

    fn validate_struct(
        &self,
        ty: &Type,
        typei: &TypeInstance,
        value: &Value,
        path: &str,
        out: &mut Vec<Violation>,
    ) {
        let map = match value.as_dict() {
            Some(map) => map,
            None => {
                out.push(Violation {
                    path: path.to_string(),
                    message: format!(
                        "expected dictionary for struct '{}', got {}",
                        ty.full_name(),
                        value.kind_name()
                    ),
                });
                return;
            }
        };

        for key in map.keys() {
            if ty.member(key).is_none() {
                out.push(Violation {
                    path: format!("{}.{}", path, key),
                    message: format!("unknown member of struct '{}'", ty.full_name()),
                });
            }
        }

        for member in ty.members() {
            let member_path = format!("{}.{}", path, member.name());
            let Some(member_typei) = member.type_instance() else {
                continue;
            };
            match map.get(member.name()) {
                Some(sub) => {
                    let resolved = self.substitute(member_typei, ty, typei);
                    self.validate_at(&resolved, sub, &member_path, out);
                }
                None => out.push(Violation {
                    path: member_path,
                    message: "missing member".to_string(),
                }),
            }
        }
    }

    fn validate_union(
        &self,
        ty: &Type,
        typei: &TypeInstance,
        value: &Value,
        path: &str,
        out: &mut Vec<Violation>,
    ) {
        let discriminator = value.dict_get(TYPE_FIELD).and_then(Value::as_str);
        let branch = match discriminator {
            Some(name) => match ty.member(name) {
                Some(member) => member,
                None => {
                    out.push(Violation {
                        path: path.to_string(),
                        message: format!(
                            "'{}' does not name a branch of union '{}'",
                            name,
                            ty.full_name()
                        ),
                    });
                    return;
                }
            },
            None => {
                out.push(Violation {
                    path: path.to_string(),
                    message: format!(
                        "union '{}' requires a dictionary with a {} discriminator",
                        ty.full_name(),
                        TYPE_FIELD
                    ),
                });
                return;
            }
        };

        let payload = match value.dict_get(VALUE_FIELD) {
            Some(payload) => payload,
            None => {
                out.push(Violation {
                    path: path.to_string(),
                    message: format!("union '{}' carries no {} payload", ty.full_name(), VALUE_FIELD),
                });
                return;
            }
        };

        if let Some(branch_typei) = branch.type_instance() {
            let resolved = self.substitute(branch_typei, ty, typei);
            self.validate_at(&resolved, payload, path, out);
        }
    }

    /// Replaces generic variables of `enclosing_type` occurring inside
    /// `decl` with the bindings carried by `enclosing_inst`.
    fn substitute(
        &self,
        decl: &TypeInstance,
        enclosing_type: &Type,
        enclosing_inst: &TypeInstance,
    ) -> TypeInstance {
        if decl.is_variable() {
            let index = enclosing_type
                .generic_vars()
                .iter()
                .position(|v| v == decl.type_name());
            return match index.and_then(|i| enclosing_inst.bindings().get(i)) {
                Some(binding) => binding.clone(),
                None => decl.clone(),
            };
        }
        if decl.bindings().is_empty() {
            return decl.clone();
        }
        let bindings = decl
            .bindings()
            .iter()
            .map(|b| self.substitute(b, enclosing_type, enclosing_inst))
            .collect();
        TypeInstance::new(decl.type_name().to_string(), false, bindings)
    }

    /// Inverts [`serialize`]: every `{%type, %value}` pair becomes a value
    /// with the named type attached. Unknown canonical forms fail.
    pub fn deserialize(&self, value: &Value) -> Result<Value, Error> {
        if let Some(map) = value.as_dict() {
            if map.contains_key(TYPE_FIELD) && map.contains_key(VALUE_FIELD) {
                let canonical = map
                    .get(TYPE_FIELD)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::Protocol(format!("{} must be a canonical form string", TYPE_FIELD))
                    })?;
                let typei = self.new_typei(canonical).map_err(|_| {
                    Error::Protocol(format!("unknown type '{}' in {}", canonical, TYPE_FIELD))
                })?;
                let payload = self.deserialize(&map[VALUE_FIELD])?;
                return Ok(payload.with_type_instance(typei));
            }
        }

        match value.kind() {
            Kind::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.deserialize(item)?);
                }
                Ok(Value::array(out))
            }
            Kind::Dictionary(map) => {
                let mut out = Value::dictionary();
                for (k, v) in map {
                    out.dict_set(k.clone(), self.deserialize(v)?);
                }
                Ok(out)
            }
            Kind::Error(e) => Ok(Value::error_with_stack(
                e.code,
                &e.message,
                self.deserialize(&e.extra)?,
                self.deserialize(&e.stack)?,
            )),
            _ => Ok(value.clone()),
        }
    }
}

/// Returns a new graph in which every value carrying a type instance is
/// replaced by a dictionary with the reserved `%type` and `%value` keys.
pub fn serialize(value: &Value) -> Value {
    let mut payload = match value.kind() {
        Kind::Array(items) => Value::array(items.iter().map(serialize)),
        Kind::Dictionary(map) => {
            let mut out = Value::dictionary();
            for (k, v) in map {
                out.dict_set(k.clone(), serialize(v));
            }
            out
        }
        Kind::Error(e) => Value::error_with_stack(
            e.code,
            &e.message,
            serialize(&e.extra),
            serialize(&e.stack),
        ),
        _ => {
            let mut bare = value.clone();
            bare.clear_type_instance();
            bare
        }
    };
    payload.clear_type_instance();

    match value.type_instance() {
        Some(typei) => Value::dictionary_from([
            (TYPE_FIELD, Value::string(typei.canonical_form())),
            (VALUE_FIELD, payload),
        ]),
        None => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::super::idl::tests::geometry_registry;
    use super::*;

    fn point(x: i64, y: i64) -> Value {
        Value::dictionary_from([("x", Value::int64(x)), ("y", Value::int64(y))])
    }

    #[test]
    fn test_validate_builtin() {
        let registry = geometry_registry();
        let typei = registry.new_typei("int64").unwrap();
        assert!(registry.is_valid(&typei, &Value::int64(5)));
        let violations = registry.validate(&typei, &Value::string("five"));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("expected int64"));
    }

    #[test]
    fn test_validate_any_accepts_everything() {
        let registry = geometry_registry();
        let typei = registry.new_typei("any").unwrap();
        assert!(registry.is_valid(&typei, &Value::int64(5)));
        assert!(registry.is_valid(&typei, &Value::dictionary()));
    }

    #[test]
    fn test_validate_struct_success() {
        let registry = geometry_registry();
        let typei = registry.new_typei("geom.Point").unwrap();
        assert!(registry.is_valid(&typei, &point(1, 2)));
    }

    #[test]
    fn test_validate_struct_bad_member_path() {
        let registry = geometry_registry();
        let typei = registry.new_typei("geom.Point").unwrap();
        let bad = Value::dictionary_from([
            ("x", Value::int64(1)),
            ("y", Value::string("two")),
        ]);
        let violations = registry.validate(&typei, &bad);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, ".y");
    }

    #[test]
    fn test_validate_struct_unknown_and_missing_members() {
        let registry = geometry_registry();
        let typei = registry.new_typei("geom.Point").unwrap();
        let bad = Value::dictionary_from([("x", Value::int64(1)), ("z", Value::int64(9))]);
        let violations = registry.validate(&typei, &bad);
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| v.path == ".z"));
        assert!(violations.iter().any(|v| v.path == ".y"));
    }

    #[test]
    fn test_validate_enum() {
        let registry = geometry_registry();
        let typei = registry.new_typei("geom.Color").unwrap();
        assert!(registry.is_valid(&typei, &Value::string("green")));
        assert!(!registry.is_valid(&typei, &Value::string("mauve")));
        assert!(!registry.is_valid(&typei, &Value::int64(1)));
    }

    #[test]
    fn test_validate_typedef_delegates() {
        let registry = geometry_registry();
        let typei = registry.new_typei("geom.Meters").unwrap();
        assert!(registry.is_valid(&typei, &Value::double(1.5)));
        assert!(!registry.is_valid(&typei, &Value::int64(1)));
    }

    #[test]
    fn test_validate_generic_typedef() {
        let registry = geometry_registry();
        let typei = registry.new_typei("geom.Wrapped<string>").unwrap();
        assert!(registry.is_valid(&typei, &Value::string("ok")));
        assert!(!registry.is_valid(&typei, &Value::int64(1)));
    }

    #[test]
    fn test_validate_union() {
        let registry = geometry_registry();
        let typei = registry.new_typei("geom.Shape").unwrap();

        let good = Value::dictionary_from([
            (TYPE_FIELD, Value::string("point")),
            (VALUE_FIELD, point(1, 2)),
        ]);
        assert!(registry.is_valid(&typei, &good));

        let wrong_branch = Value::dictionary_from([
            (TYPE_FIELD, Value::string("circle")),
            (VALUE_FIELD, Value::null()),
        ]);
        assert!(!registry.is_valid(&typei, &wrong_branch));

        assert!(!registry.is_valid(&typei, &Value::int64(1)));
    }

    #[test]
    fn test_validate_generic_struct_binding() {
        let registry = geometry_registry();
        let typei = registry.new_typei("geom.Map<string,double>").unwrap();
        let good = Value::dictionary_from([
            ("entries", Value::array([])),
            ("default", Value::double(0.0)),
        ]);
        assert!(registry.is_valid(&typei, &good));

        let bad = Value::dictionary_from([
            ("entries", Value::array([])),
            ("default", Value::string("zero")),
        ]);
        let violations = registry.validate(&typei, &bad);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, ".default");
    }

    #[test]
    fn test_unbound_variable_accepts_anything() {
        let registry = geometry_registry();
        // geom.Map left unspecialised: member typed V accepts any value.
        let map = registry.type_by_name("geom.Map").unwrap();
        let member_typei = map.member("default").unwrap().type_instance().unwrap().clone();
        assert!(registry.is_valid(&member_typei, &Value::int64(1)));
        assert!(registry.is_valid(&member_typei, &Value::string("x")));
    }

    #[test]
    fn test_serialize_round_trip() {
        let registry = geometry_registry();
        let typed = registry.new_typed("geom.Point", point(1, 2)).unwrap();

        let wire = serialize(&typed);
        assert_eq!(
            wire.dict_get(TYPE_FIELD).unwrap().as_str(),
            Some("geom.Point")
        );
        assert_eq!(
            wire.dict_get(VALUE_FIELD).unwrap().dict_get("x").unwrap().as_i64(),
            Some(1)
        );

        let back = registry.deserialize(&wire).unwrap();
        assert_eq!(
            back.type_instance().unwrap().canonical_form(),
            "geom.Point"
        );
        assert_eq!(back.hash(), typed.hash());
        assert_eq!(back, typed);
    }

    #[test]
    fn test_serialize_nested_typed_values() {
        let registry = geometry_registry();
        let inner = registry.new_typed("geom.Meters", Value::double(2.5)).unwrap();
        let outer = Value::dictionary_from([("depth", inner)]);

        let wire = serialize(&outer);
        let depth = wire.dict_get("depth").unwrap();
        assert_eq!(depth.dict_get(TYPE_FIELD).unwrap().as_str(), Some("geom.Meters"));

        let back = registry.deserialize(&wire).unwrap();
        assert_eq!(
            back.dict_get("depth").unwrap().type_instance().unwrap().canonical_form(),
            "geom.Meters"
        );
    }

    #[test]
    fn test_deserialize_unknown_type_fails() {
        let registry = geometry_registry();
        let wire = Value::dictionary_from([
            (TYPE_FIELD, Value::string("geom.Nope")),
            (VALUE_FIELD, Value::null()),
        ]);
        assert!(matches!(
            registry.deserialize(&wire),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_untyped_graph_passes_through() {
        let registry = geometry_registry();
        let v = Value::dictionary_from([("a", Value::array([Value::int64(1)]))]);
        let wire = serialize(&v);
        assert_eq!(wire, v);
        assert_eq!(registry.deserialize(&wire).unwrap(), v);
    }
}
