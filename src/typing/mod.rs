//! Declared type system: named types, generics, interfaces, validation.
//!
//! A [`Type`] is an unspecialised declaration (possibly carrying generic
//! variables); a [`TypeInstance`] binds each variable to another instance,
//! possibly itself a bare variable ("partially specialised"). The
//! [`Registry`] owns every loaded declaration and is a plain value owned
//! by the embedder; there is no process-global state.

mod idl;
mod validate;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;
use crate::value::{PackArg, Value};

pub use validate::{serialize, Violation};

/// Reserved dictionary key carrying a canonical type form.
pub const TYPE_FIELD: &str = "%type";
/// Reserved dictionary key carrying a typed payload.
pub const VALUE_FIELD: &str = "%value";

/// Classification of a declared type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeClass {
    Struct,
    Union,
    Enum,
    Typedef,
    Builtin,
}

/// A structure member, union branch or enum member.
#[derive(Clone, Debug)]
pub struct Member {
    name: String,
    description: Option<String>,
    typei: Option<TypeInstance>,
}

impl Member {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Declared type of the member. Enum members are untyped.
    pub fn type_instance(&self) -> Option<&TypeInstance> {
        self.typei.as_ref()
    }
}

/// An unspecialised declared type.
#[derive(Clone, Debug)]
pub struct Type {
    inner: Arc<TypeInner>,
}

#[derive(Debug)]
struct TypeInner {
    name: String,
    module: String,
    description: Option<String>,
    class: TypeClass,
    parent: Option<String>,
    generic_vars: Vec<String>,
    members: Vec<Member>,
    definition: Option<TypeInstance>,
}

impl Type {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Dotted name: `module.Name`, or the bare name for builtins.
    pub fn full_name(&self) -> String {
        if self.inner.module.is_empty() {
            self.inner.name.clone()
        } else {
            format!("{}.{}", self.inner.module, self.inner.name)
        }
    }

    pub fn description(&self) -> Option<&str> {
        self.inner.description.as_deref()
    }

    pub fn class(&self) -> TypeClass {
        self.inner.class
    }

    /// Name of the parent type in the declaration chain, if any.
    pub fn parent(&self) -> Option<&str> {
        self.inner.parent.as_deref()
    }

    pub fn generic_vars(&self) -> &[String] {
        &self.inner.generic_vars
    }

    pub fn generic_var(&self, index: usize) -> Option<&str> {
        self.inner.generic_vars.get(index).map(|s| s.as_str())
    }

    pub fn members(&self) -> &[Member] {
        &self.inner.members
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.inner.members.iter().find(|m| m.name == name)
    }

    /// Underlying definition of a typedef; `None` for other classes.
    pub fn definition(&self) -> Option<&TypeInstance> {
        self.inner.definition.as_ref()
    }
}

/// A (possibly partially) specialised type.
///
/// Identity is the cached canonical form: two instances with equal
/// canonical strings denote the same specialisation.
#[derive(Clone, Debug)]
pub struct TypeInstance {
    inner: Arc<TypeInstanceInner>,
}

#[derive(Debug)]
struct TypeInstanceInner {
    /// Dotted base type name, or the variable name for unbound variables.
    name: String,
    variable: bool,
    bindings: Vec<TypeInstance>,
    canonical: String,
}

impl TypeInstance {
    fn new(name: String, variable: bool, bindings: Vec<TypeInstance>) -> TypeInstance {
        let canonical = if bindings.is_empty() {
            name.clone()
        } else {
            let inner: Vec<&str> = bindings.iter().map(|b| b.canonical_form()).collect();
            format!("{}<{}>", name, inner.join(","))
        };
        TypeInstance {
            inner: Arc::new(TypeInstanceInner {
                name,
                variable,
                bindings,
                canonical,
            }),
        }
    }

    pub(crate) fn variable(name: &str) -> TypeInstance {
        TypeInstance::new(name.to_string(), true, Vec::new())
    }

    /// Dotted name of the base type (or the variable name).
    pub fn type_name(&self) -> &str {
        &self.inner.name
    }

    /// True for an unbound generic variable placeholder.
    pub fn is_variable(&self) -> bool {
        self.inner.variable
    }

    /// Bindings for the base type's generic variables, in declaration
    /// order. Empty when the base type is not generic.
    pub fn bindings(&self) -> &[TypeInstance] {
        &self.inner.bindings
    }

    /// The unique string denoting this specialisation.
    pub fn canonical_form(&self) -> &str {
        &self.inner.canonical
    }

    /// True when no unbound variable occurs anywhere in the instance.
    pub fn is_fully_specialised(&self) -> bool {
        !self.inner.variable && self.inner.bindings.iter().all(|b| b.is_fully_specialised())
    }
}

impl PartialEq for TypeInstance {
    fn eq(&self, other: &TypeInstance) -> bool {
        self.canonical_form() == other.canonical_form()
    }
}

impl Eq for TypeInstance {}

impl std::hash::Hash for TypeInstance {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical_form().hash(state);
    }
}

impl fmt::Display for TypeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_form())
    }
}

/// A named grouping of methods, properties and events.
#[derive(Clone, Debug)]
pub struct Interface {
    inner: Arc<InterfaceInner>,
}

#[derive(Debug)]
struct InterfaceInner {
    name: String,
    description: Option<String>,
    members: Vec<IfMember>,
}

impl Interface {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> Option<&str> {
        self.inner.description.as_deref()
    }

    pub fn members(&self) -> &[IfMember] {
        &self.inner.members
    }

    pub fn member(&self, name: &str) -> Option<&IfMember> {
        self.inner.members.iter().find(|m| m.name() == name)
    }

    pub fn method(&self, name: &str) -> Option<&IfMember> {
        self.member(name)
            .filter(|m| matches!(m, IfMember::Method { .. }))
    }
}

/// A method, property or event descriptor inside an interface.
#[derive(Clone, Debug)]
pub enum IfMember {
    Method {
        name: String,
        description: Option<String>,
        returns: Option<TypeInstance>,
        args: Vec<Argument>,
    },
    Property {
        name: String,
        description: Option<String>,
        typei: TypeInstance,
    },
    Event {
        name: String,
        description: Option<String>,
    },
}

impl IfMember {
    pub fn name(&self) -> &str {
        match self {
            IfMember::Method { name, .. }
            | IfMember::Property { name, .. }
            | IfMember::Event { name, .. } => name,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            IfMember::Method { description, .. }
            | IfMember::Property { description, .. }
            | IfMember::Event { description, .. } => description.as_deref(),
        }
    }
}

/// A declared method argument.
#[derive(Clone, Debug)]
pub struct Argument {
    name: String,
    description: Option<String>,
    typei: TypeInstance,
}

impl Argument {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn type_instance(&self) -> &TypeInstance {
        &self.typei
    }
}

/// Names of the builtin types registered with every fresh registry.
const BUILTINS: &[&str] = &[
    "null",
    "bool",
    "int64",
    "uint64",
    "double",
    "date",
    "string",
    "binary",
    "fd",
    "shmem",
    "error",
    "array",
    "dictionary",
    "any",
];

struct PendingFile {
    path: PathBuf,
    module: String,
    doc: serde_json::Value,
}

#[derive(Default)]
struct RegistryInner {
    types: HashMap<String, Type>,
    interfaces: HashMap<String, Interface>,
    pending: Vec<PendingFile>,
}

/// Holds every loaded type and interface declaration.
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    /// Fresh registry holding only the builtin types.
    pub fn new() -> Registry {
        let registry = Registry {
            inner: RwLock::new(RegistryInner::default()),
        };
        {
            let mut inner = registry.inner.write();
            for name in BUILTINS {
                inner.types.insert(
                    name.to_string(),
                    Type {
                        inner: Arc::new(TypeInner {
                            name: name.to_string(),
                            module: String::new(),
                            description: None,
                            class: TypeClass::Builtin,
                            parent: None,
                            generic_vars: Vec::new(),
                            members: Vec::new(),
                            definition: None,
                        }),
                    },
                );
            }
        }
        registry
    }

    /// Looks up a type by name. Dotted names match exactly; a bare name
    /// matches a builtin, or a loaded type when the suffix is unambiguous.
    pub fn type_by_name(&self, name: &str) -> Option<Type> {
        let inner = self.inner.read();
        if let Some(ty) = inner.types.get(name) {
            return Some(ty.clone());
        }
        if !name.contains('.') {
            let suffix = format!(".{}", name);
            let mut found = None;
            for (key, ty) in &inner.types {
                if key.ends_with(&suffix) {
                    if found.is_some() {
                        return None;
                    }
                    found = Some(ty.clone());
                }
            }
            return found;
        }
        None
    }

    /// Snapshot of every registered type.
    pub fn types(&self) -> Vec<Type> {
        self.inner.read().types.values().cloned().collect()
    }

    pub fn interface(&self, name: &str) -> Option<Interface> {
        self.inner.read().interfaces.get(name).cloned()
    }

    /// Snapshot of every registered interface.
    pub fn interfaces(&self) -> Vec<Interface> {
        self.inner.read().interfaces.values().cloned().collect()
    }

    /// Parses a declaration string (`Name` or `Name<arg, ...>`) into a
    /// fully or partially specialised instance.
    pub fn new_typei(&self, decl: &str) -> Result<TypeInstance, Error> {
        self.parse_decl(decl, &[])
    }

    /// Builds a value and attaches the declared type to it.
    pub fn new_typed(&self, decl: &str, value: Value) -> Result<Value, Error> {
        let typei = self.new_typei(decl)?;
        Ok(value.with_type_instance(typei))
    }

    /// [`Value::pack`] with `<decl>` typed-wrap tokens enabled.
    pub fn pack<I>(&self, fmt: &str, args: I) -> Result<Value, Error>
    where
        I: IntoIterator,
        I::Item: Into<PackArg>,
    {
        crate::value::pack::pack_with(Some(self), fmt, args.into_iter().map(Into::into).collect())
    }

    /// Binding of `var` inside `typei`, resolved against the base type's
    /// declared variable list.
    pub fn typei_generic_var(&self, typei: &TypeInstance, var: &str) -> Option<TypeInstance> {
        let ty = self.type_by_name(typei.type_name())?;
        let index = ty.generic_vars().iter().position(|v| v == var)?;
        typei.bindings().get(index).cloned()
    }

    pub(crate) fn parse_decl(&self, decl: &str, scope: &[String]) -> Result<TypeInstance, Error> {
        let mut parser = DeclParser {
            text: decl.as_bytes(),
            pos: 0,
        };
        let typei = parser.parse(self, scope)?;
        parser.skip_ws();
        if parser.pos != parser.text.len() {
            return Err(Error::Invalid(format!(
                "trailing characters in type declaration '{}'",
                decl
            )));
        }
        Ok(typei)
    }

    fn register_type(&self, ty: Type) -> Result<(), Error> {
        let full = ty.full_name();
        let mut inner = self.inner.write();
        if inner.types.contains_key(&full) {
            return Err(Error::Invalid(format!("duplicate type '{}'", full)));
        }
        inner.types.insert(full, ty);
        Ok(())
    }

    fn replace_type(&self, ty: Type) {
        let full = ty.full_name();
        self.inner.write().types.insert(full, ty);
    }

    fn register_interface(&self, iface: Interface) -> Result<(), Error> {
        let mut inner = self.inner.write();
        if inner.interfaces.contains_key(iface.name()) {
            return Err(Error::Invalid(format!(
                "duplicate interface '{}'",
                iface.name()
            )));
        }
        inner.interfaces.insert(iface.name().to_string(), iface);
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

struct DeclParser<'a> {
    text: &'a [u8],
    pos: usize,
}

impl<'a> DeclParser<'a> {
    fn skip_ws(&mut self) {
        while self.text.get(self.pos).map_or(false, |c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse(&mut self, registry: &Registry, scope: &[String]) -> Result<TypeInstance, Error> {
        self.skip_ws();
        let start = self.pos;
        while self.text.get(self.pos).map_or(false, |c| {
            c.is_ascii_alphanumeric() || *c == b'_' || *c == b'.'
        }) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(Error::Invalid("empty name in type declaration".into()));
        }
        let name = std::str::from_utf8(&self.text[start..self.pos])
            .map_err(|_| Error::Invalid("non-UTF-8 type declaration".into()))?;

        let mut bindings = Vec::new();
        self.skip_ws();
        if self.text.get(self.pos) == Some(&b'<') {
            self.pos += 1;
            loop {
                bindings.push(self.parse(registry, scope)?);
                self.skip_ws();
                match self.text.get(self.pos) {
                    Some(b',') => self.pos += 1,
                    Some(b'>') => {
                        self.pos += 1;
                        break;
                    }
                    _ => {
                        return Err(Error::Invalid(
                            "expected ',' or '>' in type declaration".into(),
                        ))
                    }
                }
            }
        }

        // A bare name matching a generic variable in scope denotes the
        // variable itself.
        if bindings.is_empty() && scope.iter().any(|v| v == name) {
            return Ok(TypeInstance::variable(name));
        }

        let ty = registry
            .type_by_name(name)
            .ok_or_else(|| Error::NotFound(format!("type '{}'", name)))?;
        if ty.generic_vars().len() != bindings.len() {
            return Err(Error::Invalid(format!(
                "type '{}' takes {} generic arguments, {} given",
                ty.full_name(),
                ty.generic_vars().len(),
                bindings.len()
            )));
        }
        Ok(TypeInstance::new(ty.full_name(), false, bindings))
    }
}
