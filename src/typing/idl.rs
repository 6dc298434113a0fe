//! IDL file loading.
//!
//! IDL files are UTF-8 JSON documents. The top-level object carries a
//! `"module"` name plus one entry per declaration, keyed by class and
//! name: `"struct Point"`, `"union Shape<T>"`, `"enum Color"`,
//! `"typedef Meters"`, `"interface Adder"`.
//!
//! Loading is two-pass: a read pass records each file and its module, a
//! resolve pass registers type shells and then links member declarations.
//! The split allows declarations to forward-reference types from sibling
//! files loaded in the same batch.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value as Json;
use tracing::debug;

use crate::error::Error;

use super::{
    Argument, IfMember, Interface, InterfaceInner, Member, PendingFile, Registry, Type,
    TypeClass, TypeInner,
};

impl Registry {
    /// Read pass for a single IDL file. The declarations become visible
    /// once [`Registry::resolve_pending`] runs.
    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let doc: Json = serde_json::from_str(&text)
            .map_err(|e| Error::Invalid(format!("{}: {}", path.display(), e)))?;
        let module = doc
            .get("module")
            .and_then(Json::as_str)
            .ok_or_else(|| {
                Error::Invalid(format!("{}: missing \"module\" entry", path.display()))
            })?
            .to_string();

        debug!(path = %path.display(), module = %module, "read IDL file");
        self.inner.write().pending.push(PendingFile {
            path: path.to_path_buf(),
            module,
            doc,
        });
        Ok(())
    }

    /// Loads a single IDL file: read pass plus resolve pass.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.read_file(path)?;
        self.resolve_pending()
    }

    /// Walks a directory tree, reading every `.json` file, then resolves
    /// the whole batch so files may reference each other freely.
    pub fn load_dir(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        self.read_dir_recursive(path.as_ref())?;
        self.resolve_pending()
    }

    fn read_dir_recursive(&self, dir: &Path) -> Result<(), Error> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.path());
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                self.read_dir_recursive(&path)?;
            } else if path.extension().map_or(false, |ext| ext == "json") {
                self.read_file(&path)?;
            }
        }
        Ok(())
    }

    /// Resolve pass: registers type shells for every pending file, then
    /// links member and interface declarations against the full name set.
    pub fn resolve_pending(&self) -> Result<(), Error> {
        let pending = std::mem::take(&mut self.inner.write().pending);

        // Shell registration first, so member declarations may reference
        // any type from the batch regardless of file order.
        for file in &pending {
            for (key, _body) in declarations(&file.doc) {
                let decl = DeclKey::parse(key, &file.path)?;
                if decl.class == DeclClass::Interface {
                    continue;
                }
                self.register_type(shell_type(&decl, &file.module))?;
            }
        }

        for file in &pending {
            for (key, body) in declarations(&file.doc) {
                let decl = DeclKey::parse(key, &file.path)?;
                match decl.class {
                    DeclClass::Interface => {
                        let iface = self.build_interface(&decl, &file.module, body)?;
                        self.register_interface(iface)?;
                    }
                    _ => {
                        let ty = self.build_type(&decl, &file.module, body)?;
                        self.replace_type(ty);
                    }
                }
            }
        }

        Ok(())
    }

    fn build_type(&self, decl: &DeclKey, module: &str, body: &Json) -> Result<Type, Error> {
        let description = body
            .get("description")
            .and_then(Json::as_str)
            .map(str::to_string);
        let parent = body.get("extends").and_then(Json::as_str).map(str::to_string);

        let mut members = Vec::new();
        let mut definition = None;

        match decl.class {
            DeclClass::Struct | DeclClass::Union => {
                let map = body
                    .get("members")
                    .and_then(Json::as_object)
                    .ok_or_else(|| {
                        Error::Invalid(format!("{}: missing members object", decl.name))
                    })?;
                for (name, entry) in map {
                    let (type_decl, description) = member_entry(entry)
                        .ok_or_else(|| {
                            Error::Invalid(format!("{}.{}: bad member entry", decl.name, name))
                        })?;
                    let typei = self.parse_decl(type_decl, &decl.generic_vars)?;
                    members.push(Member {
                        name: name.clone(),
                        description,
                        typei: Some(typei),
                    });
                }
            }
            DeclClass::Enum => {
                let list = body.get("members").and_then(Json::as_array).ok_or_else(|| {
                    Error::Invalid(format!("{}: missing members array", decl.name))
                })?;
                for entry in list {
                    let (name, description) = match entry {
                        Json::String(name) => (name.clone(), None),
                        Json::Object(obj) => {
                            let name = obj
                                .get("name")
                                .and_then(Json::as_str)
                                .ok_or_else(|| {
                                    Error::Invalid(format!("{}: unnamed enum member", decl.name))
                                })?;
                            (
                                name.to_string(),
                                obj.get("description")
                                    .and_then(Json::as_str)
                                    .map(str::to_string),
                            )
                        }
                        _ => {
                            return Err(Error::Invalid(format!(
                                "{}: bad enum member entry",
                                decl.name
                            )))
                        }
                    };
                    members.push(Member {
                        name,
                        description,
                        typei: None,
                    });
                }
            }
            DeclClass::Typedef => {
                let type_decl = body.get("type").and_then(Json::as_str).ok_or_else(|| {
                    Error::Invalid(format!("{}: missing typedef type", decl.name))
                })?;
                definition = Some(self.parse_decl(type_decl, &decl.generic_vars)?);
            }
            DeclClass::Interface => unreachable!("interfaces are built separately"),
        }

        Ok(Type {
            inner: Arc::new(TypeInner {
                name: decl.name.clone(),
                module: module.to_string(),
                description,
                class: decl.class.into(),
                parent,
                generic_vars: decl.generic_vars.clone(),
                members,
                definition,
            }),
        })
    }

    fn build_interface(
        &self,
        decl: &DeclKey,
        module: &str,
        body: &Json,
    ) -> Result<Interface, Error> {
        if !decl.generic_vars.is_empty() {
            return Err(Error::Invalid(format!(
                "interface {} may not be generic",
                decl.name
            )));
        }

        let mut members = Vec::new();

        if let Some(methods) = body.get("methods").and_then(Json::as_object) {
            for (name, entry) in methods {
                let returns = match entry.get("return").and_then(Json::as_str) {
                    Some(decl) => Some(self.parse_decl(decl, &[])?),
                    None => None,
                };
                let mut args = Vec::new();
                if let Some(list) = entry.get("args").and_then(Json::as_array) {
                    for arg in list {
                        let arg_name =
                            arg.get("name").and_then(Json::as_str).ok_or_else(|| {
                                Error::Invalid(format!("{}.{}: unnamed argument", decl.name, name))
                            })?;
                        let type_decl =
                            arg.get("type").and_then(Json::as_str).ok_or_else(|| {
                                Error::Invalid(format!(
                                    "{}.{}: argument without type",
                                    decl.name, name
                                ))
                            })?;
                        args.push(Argument {
                            name: arg_name.to_string(),
                            description: arg
                                .get("description")
                                .and_then(Json::as_str)
                                .map(str::to_string),
                            typei: self.parse_decl(type_decl, &[])?,
                        });
                    }
                }
                members.push(IfMember::Method {
                    name: name.clone(),
                    description: entry
                        .get("description")
                        .and_then(Json::as_str)
                        .map(str::to_string),
                    returns,
                    args,
                });
            }
        }

        if let Some(properties) = body.get("properties").and_then(Json::as_object) {
            for (name, entry) in properties {
                let (type_decl, description) = member_entry(entry).ok_or_else(|| {
                    Error::Invalid(format!("{}.{}: bad property entry", decl.name, name))
                })?;
                members.push(IfMember::Property {
                    name: name.clone(),
                    description,
                    typei: self.parse_decl(type_decl, &[])?,
                });
            }
        }

        if let Some(events) = body.get("events").and_then(Json::as_array) {
            for entry in events {
                let (name, description) = match entry {
                    Json::String(name) => (name.clone(), None),
                    Json::Object(obj) => (
                        obj.get("name")
                            .and_then(Json::as_str)
                            .ok_or_else(|| {
                                Error::Invalid(format!("{}: unnamed event", decl.name))
                            })?
                            .to_string(),
                        obj.get("description")
                            .and_then(Json::as_str)
                            .map(str::to_string),
                    ),
                    _ => {
                        return Err(Error::Invalid(format!("{}: bad event entry", decl.name)))
                    }
                };
                members.push(IfMember::Event { name, description });
            }
        }

        Ok(Interface {
            inner: Arc::new(InterfaceInner {
                name: format!("{}.{}", module, decl.name),
                description: body
                    .get("description")
                    .and_then(Json::as_str)
                    .map(str::to_string),
                members,
            }),
        })
    }
}

/// A `type: decl-string` entry or an object with `type`/`description`.
fn member_entry(entry: &Json) -> Option<(&str, Option<String>)> {
    match entry {
        Json::String(decl) => Some((decl, None)),
        Json::Object(obj) => {
            let decl = obj.get("type").and_then(Json::as_str)?;
            Some((
                decl,
                obj.get("description").and_then(Json::as_str).map(str::to_string),
            ))
        }
        _ => None,
    }
}

fn declarations(doc: &Json) -> impl Iterator<Item = (&String, &Json)> {
    doc.as_object()
        .into_iter()
        .flatten()
        .filter(|(key, _)| key.as_str() != "module")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeclClass {
    Struct,
    Union,
    Enum,
    Typedef,
    Interface,
}

impl From<DeclClass> for TypeClass {
    fn from(class: DeclClass) -> TypeClass {
        match class {
            DeclClass::Struct => TypeClass::Struct,
            DeclClass::Union => TypeClass::Union,
            DeclClass::Enum => TypeClass::Enum,
            DeclClass::Typedef => TypeClass::Typedef,
            DeclClass::Interface => unreachable!("interfaces are not types"),
        }
    }
}

struct DeclKey {
    class: DeclClass,
    name: String,
    generic_vars: Vec<String>,
}

impl DeclKey {
    fn parse(key: &str, path: &Path) -> Result<DeclKey, Error> {
        let bad = |msg: &str| {
            Error::Invalid(format!("{}: {} in '{}'", path.display(), msg, key))
        };

        let (class_word, rest) = key
            .split_once(char::is_whitespace)
            .ok_or_else(|| bad("declaration key needs a class and a name"))?;
        let class = match class_word {
            "struct" => DeclClass::Struct,
            "union" => DeclClass::Union,
            "enum" => DeclClass::Enum,
            "typedef" => DeclClass::Typedef,
            "interface" => DeclClass::Interface,
            _ => return Err(bad("unknown declaration class")),
        };

        let rest = rest.trim();
        let (name, generic_vars) = match rest.split_once('<') {
            Some((name, vars)) => {
                let vars = vars
                    .strip_suffix('>')
                    .ok_or_else(|| bad("unterminated generic variable list"))?;
                let vars: Vec<String> = vars
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                if vars.is_empty() {
                    return Err(bad("empty generic variable list"));
                }
                (name.trim().to_string(), vars)
            }
            None => (rest.to_string(), Vec::new()),
        };

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(bad("bad declaration name"));
        }

        Ok(DeclKey {
            class,
            name,
            generic_vars,
        })
    }
}

fn shell_type(decl: &DeclKey, module: &str) -> Type {
    Type {
        inner: Arc::new(TypeInner {
            name: decl.name.clone(),
            module: module.to_string(),
            description: None,
            class: decl.class.into(),
            parent: None,
            generic_vars: decl.generic_vars.clone(),
            members: Vec::new(),
            definition: None,
        }),
    }
}
