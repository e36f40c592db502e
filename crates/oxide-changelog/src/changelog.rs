//! Changelog reading.
//!
//! A changelog directory holds a descriptor listing the migration scripts
//! in the order they must be applied. Two descriptor formats are supported,
//! checked in this order:
//!
//! - `changelog.xml`: every child element of the root carries a `file`
//!   attribute and an optional `context` attribute.
//! - `changelog.yaml` (or `changelog.yml`): a list of `{file, context}`
//!   mappings.
//!
//! Entries are returned in file order; nothing is sorted.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde::Deserialize;

use crate::error::{MigrateError, Result};

/// One entry of the changelog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MigrationRef {
    /// Script path, relative to the changelog directory.
    pub file: String,
    /// Context tag restricting the runs that apply this migration.
    #[serde(default)]
    pub context: Option<String>,
}

impl MigrationRef {
    /// Creates an untagged migration reference.
    #[must_use]
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            context: None,
        }
    }

    /// Tags this reference with a context.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Supported descriptor formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangelogFormat {
    /// `changelog.xml`
    Xml,
    /// `changelog.yaml` / `changelog.yml`
    Yaml,
}

/// Descriptor file names, in lookup priority.
pub const DESCRIPTORS: &[(&str, ChangelogFormat)] = &[
    ("changelog.xml", ChangelogFormat::Xml),
    ("changelog.yaml", ChangelogFormat::Yaml),
    ("changelog.yml", ChangelogFormat::Yaml),
];

/// Finds the descriptor of a changelog directory.
pub fn locate(dir: &Path) -> Result<(PathBuf, ChangelogFormat)> {
    DESCRIPTORS
        .iter()
        .map(|(name, format)| (dir.join(name), *format))
        .find(|(path, _)| path.is_file())
        .ok_or_else(|| MigrateError::NotFound(dir.to_path_buf()))
}

/// Reads the changelog of a directory.
///
/// The XML form is parsed lazily while iterating; the YAML form is parsed
/// up front.
pub fn read(dir: &Path) -> Result<Changelog> {
    let (path, format) = locate(dir)?;
    match format {
        ChangelogFormat::Xml => XmlChangelog::open(&path).map(Changelog::Xml),
        ChangelogFormat::Yaml => read_yaml(&path).map(|refs| Changelog::Yaml {
            path,
            entries: refs.into_iter(),
        }),
    }
}

/// An ordered sequence of migration references.
pub enum Changelog {
    /// Streaming XML descriptor.
    Xml(XmlChangelog),
    /// Fully parsed YAML descriptor.
    Yaml {
        /// Descriptor path.
        path: PathBuf,
        /// Remaining entries.
        entries: std::vec::IntoIter<MigrationRef>,
    },
}

impl Changelog {
    /// Returns the descriptor path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Xml(xml) => &xml.path,
            Self::Yaml { path, .. } => path,
        }
    }
}

impl Iterator for Changelog {
    type Item = Result<MigrationRef>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Xml(xml) => xml.next(),
            Self::Yaml { entries, .. } => entries.next().map(Ok),
        }
    }
}

fn read_yaml(path: &Path) -> Result<Vec<MigrationRef>> {
    let file = File::open(path)?;
    // An empty document is an empty changelog.
    let refs: Option<Vec<MigrationRef>> =
        serde_yaml::from_reader(BufReader::new(file)).map_err(|e| changelog_error(path, e))?;
    Ok(refs.unwrap_or_default())
}

/// Lazily parsed `changelog.xml`.
pub struct XmlChangelog {
    path: PathBuf,
    reader: Reader<BufReader<File>>,
    buf: Vec<u8>,
    depth: usize,
    done: bool,
}

impl XmlChangelog {
    /// Opens an XML descriptor.
    pub fn open(path: &Path) -> Result<Self> {
        let reader = Reader::from_file(path).map_err(|e| changelog_error(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            buf: Vec::new(),
            depth: 0,
            done: false,
        })
    }
}

impl Iterator for XmlChangelog {
    type Item = Result<MigrationRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(e) => {
                    self.done = true;
                    return Some(Err(changelog_error(&self.path, e)));
                }
            };

            match event {
                Event::Start(element) => {
                    self.depth += 1;
                    if self.depth == 2 {
                        return Some(element_to_ref(&self.path, &element));
                    }
                }
                Event::Empty(element) if self.depth == 1 => {
                    return Some(element_to_ref(&self.path, &element));
                }
                Event::End(_) => self.depth = self.depth.saturating_sub(1),
                Event::Eof => {
                    self.done = true;
                    return None;
                }
                _ => {}
            }
        }
    }
}

fn element_to_ref(path: &Path, element: &BytesStart<'_>) -> Result<MigrationRef> {
    let mut file = None;
    let mut context = None;

    for attr in element.attributes() {
        let attr = attr.map_err(|e| changelog_error(path, e))?;
        let value = attr
            .unescape_value()
            .map_err(|e| changelog_error(path, e))?
            .into_owned();
        match attr.key.as_ref() {
            b"file" => file = Some(value),
            b"context" => context = Some(value),
            _ => {}
        }
    }

    let file = file.ok_or_else(|| MigrateError::Changelog {
        path: path.to_path_buf(),
        message: format!(
            "element <{}> has no 'file' attribute",
            String::from_utf8_lossy(element.name().as_ref())
        ),
    })?;

    Ok(MigrationRef { file, context })
}

fn changelog_error(path: &Path, error: impl std::fmt::Display) -> MigrateError {
    MigrateError::Changelog {
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}
