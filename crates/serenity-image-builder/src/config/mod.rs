use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

/// A resolved build configuration. Every key is optional; an empty document
/// reproduces the stock x86_64 / GNU / GRUB UEFI pipeline.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn defaults() -> Self {
        Self {
            path: PathBuf::from("<defaults>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn table_path(&self, path: &str) -> Option<&toml::value::Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("invalid config at '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    /// Top-level keys, for schema validation.
    pub fn root_keys(&self) -> Vec<&str> {
        self.value
            .as_table()
            .map(|t| t.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Set a dotted key, creating intermediate tables as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        let mut overlay = value;
        for seg in path.rsplit('.') {
            let mut tbl = toml::value::Table::new();
            tbl.insert(seg.to_string(), overlay);
            overlay = Value::Table(tbl);
        }
        merge(&mut self.value, overlay);
    }
}

/// Deep-merge `overlay` into `base`; tables merge key by key, anything else
/// in the overlay replaces the base value.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn resolve_relative_to(file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value(path: &Path, chain: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !chain.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let parent = match value.as_table_mut().and_then(|t| t.remove("extends")) {
        None => None,
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(_) => {
            return Err(Error::msg(format!(
                "invalid extends in {} (expected a non-empty string)",
                path.display()
            )));
        }
    };

    let mut out = match parent {
        Some(p) => load_value(&resolve_relative_to(path, p.trim()), chain)?,
        None => Value::Table(Default::default()),
    };
    merge(&mut out, value);

    chain.remove(&canonical);
    Ok(out)
}

/// Load a config file, applying single-parent `extends = "base.toml"` chains.
pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut chain = HashSet::new();
    let value = load_value(path, &mut chain)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Load `path` if given, otherwise start from defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<ConfigDoc> {
    match path {
        Some(p) => load(p),
        None => Ok(ConfigDoc::defaults()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_merges_child_over_parent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[serenity]\narch = \"x86_64\"\ntoolchain = \"GNU\"\n",
        )
        .expect("write base");
        fs::write(
            tmp.path().join("ci.toml"),
            "extends = \"base.toml\"\n[serenity]\ntoolchain = \"Clang\"\n",
        )
        .expect("write child");

        let doc = load(&tmp.path().join("ci.toml")).expect("load");
        assert_eq!(
            doc.value_path("serenity.arch").and_then(Value::as_str),
            Some("x86_64")
        );
        assert_eq!(
            doc.value_path("serenity.toolchain").and_then(Value::as_str),
            Some("Clang")
        );
        assert!(doc.value_path("extends").is_none());
    }

    #[test]
    fn extends_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");

        let err = load(&tmp.path().join("a.toml")).unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn set_creates_nested_tables() {
        let mut doc = ConfigDoc::defaults();
        doc.set("workspace.root_dir", Value::String("/srv/build".into()));
        assert_eq!(
            doc.value_path("workspace.root_dir").and_then(Value::as_str),
            Some("/srv/build")
        );
        assert!(doc.has_table_path("workspace"));
    }
}
