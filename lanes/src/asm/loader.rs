// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

/// Finds the text of an imported source.
pub trait SourceLoader {
    /// Loads `name` as imported from the source called `from`. Returns the
    /// name the loaded source should be known by and its text.
    fn load(&mut self, name: &str, from: &str) -> io::Result<(String, String)>;
}

/// Loads files relative to the importing file, then from each search path
/// in order.
#[derive(Clone, Debug, Default)]
pub struct FsLoader {
    pub search_paths: Vec<PathBuf>,
}

impl FsLoader {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    fn candidates(&self, name: &str, from: &str) -> Vec<PathBuf> {
        let mut candidates = vec![];
        if let Some(parent) = Path::new(from).parent() {
            candidates.push(parent.join(name));
        }
        candidates.push(PathBuf::from(name));
        candidates.extend(self.search_paths.iter().map(|path| path.join(name)));
        candidates
    }
}

impl SourceLoader for FsLoader {
    fn load(&mut self, name: &str, from: &str) -> io::Result<(String, String)> {
        for path in self.candidates(name, from) {
            match fs::read_to_string(&path) {
                Ok(text) => return Ok((path.display().to_string(), text)),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("`{name}` not found next to `{from}` or in a search path"),
        ))
    }
}

/// Serves sources from a map, for embedding and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryLoader {
    files: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.files.insert(name.into(), text.into());
    }
}

impl SourceLoader for MemoryLoader {
    fn load(
        &mut self,
        name: &str,
        _from: &str,
    ) -> io::Result<(String, String)> {
        self.files
            .get(name)
            .map(|text| (name.to_string(), text.clone()))
            .ok_or_else(|| {
                let message = format!("no source `{name}`");
                io::Error::new(io::ErrorKind::NotFound, message)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_loader_serves_inserted_text() {
        let mut loader = MemoryLoader::default();
        loader.insert("lib.lanes", "nop");
        assert_eq!(
            ("lib.lanes".to_string(), "nop".to_string()),
            loader.load("lib.lanes", "main.lanes").unwrap()
        );
        assert_eq!(
            io::ErrorKind::NotFound,
            loader.load("other.lanes", "main.lanes").unwrap_err().kind()
        );
    }

    #[test]
    fn fs_loader_tries_importer_directory_first() {
        let loader = FsLoader::new(vec![PathBuf::from("/opt/lib")]);
        assert_eq!(
            vec![
                PathBuf::from("src/util.lanes"),
                PathBuf::from("util.lanes"),
                PathBuf::from("/opt/lib/util.lanes"),
            ],
            loader.candidates("util.lanes", "src/main.lanes")
        );
    }
}
