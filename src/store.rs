use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A YAML document backed by a single file.
///
/// Every successful [`Store::save`] re-reads the file and only reports success when
/// the document on disk matches the one in memory.
#[derive(Debug)]
pub struct Store<T> {
    path: PathBuf,
    doc: T,
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    /// Opens the document at `path`, creating an empty file on first run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self>
    where
        T: Default,
    {
        let path = path.into();
        if !path.exists() {
            ensure_parent(&path)?;
            fs::write(&path, "").map_err(|e| Error::io(&path, e))?;
        }
        let doc = read_document::<T>(&path)?.unwrap_or_default();
        Ok(Self { path, doc })
    }

    /// Writes `doc` to a new file at `path` and verifies it.
    pub fn create(path: impl Into<PathBuf>, doc: T) -> Result<Self> {
        let mut store = Self {
            path: path.into(),
            doc,
        };
        store.save()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> &T {
        &self.doc
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.doc
    }

    /// Replaces the in-memory document with what is on disk. Unsaved edits are lost.
    pub fn reload(&mut self) -> Result<()>
    where
        T: Default,
    {
        self.doc = read_document::<T>(&self.path)?.unwrap_or_default();
        Ok(())
    }

    pub fn save(&mut self) -> Result<()> {
        ensure_parent(&self.path)?;
        let yaml = serde_yaml::to_string(&self.doc).map_err(|e| Error::parse(&self.path, e))?;
        fs::write(&self.path, yaml).map_err(|e| Error::io(&self.path, e))?;

        match read_document::<T>(&self.path)? {
            Some(reread) if reread == self.doc => {
                self.doc = reread;
                debug!("saved {:?}", self.path);
                Ok(())
            }
            _ => Err(Error::SaveVerification {
                path: self.path.clone(),
            }),
        }
    }
}

/// Reads a document; an empty or `null` file yields `None`.
fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let value: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| Error::parse(path, e))?;
    if value.is_null() {
        return Ok(None);
    }
    serde_yaml::from_value(value)
        .map(Some)
        .map_err(|e| Error::parse(path, e))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        #[serde(default)]
        items: Vec<String>,
        #[serde(default)]
        port: Option<u16>,
    }

    #[test]
    fn missing_file_loads_as_empty_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("doc.yaml");
        let store: Store<Doc> = Store::open(&path).unwrap();
        assert_eq!(store.get(), &Doc::default());
        assert!(path.exists());
    }

    #[test]
    fn null_document_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.yaml");
        fs::write(&path, "~\n").unwrap();
        let store: Store<Doc> = Store::open(&path).unwrap();
        assert_eq!(store.get(), &Doc::default());
    }

    #[test]
    fn save_then_open_yields_same_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.yaml");
        let mut store: Store<Doc> = Store::open(&path).unwrap();
        store.get_mut().items = vec!["a".into(), "b".into()];
        store.get_mut().port = Some(7899);
        store.save().unwrap();

        let reopened: Store<Doc> = Store::open(&path).unwrap();
        assert_eq!(reopened.get(), store.get());
    }

    #[test]
    fn reload_discards_unsaved_edits() {
        let dir = TempDir::new().unwrap();
        let mut store: Store<Doc> = Store::open(dir.path().join("doc.yaml")).unwrap();
        store.get_mut().items.push("kept".into());
        store.save().unwrap();
        store.get_mut().items.push("lost".into());
        store.reload().unwrap();
        assert_eq!(store.get().items, vec!["kept".to_string()]);
    }

    #[test]
    fn malformed_yaml_is_a_parse_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.yaml");
        fs::write(&path, "items: [unclosed").unwrap();
        let err = Store::<Doc>::open(&path).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn save_into_a_directory_is_an_io_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.yaml");
        let mut store: Store<Doc> = Store::open(&path).unwrap();
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        store.get_mut().port = Some(1);
        assert!(matches!(store.save(), Err(Error::Io { .. })));
        // the edit stays in memory
        assert_eq!(store.get().port, Some(1));
    }
}
