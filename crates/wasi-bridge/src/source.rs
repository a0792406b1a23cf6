use std::borrow::Cow;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use wasmparser::Parser;

use crate::error::{Error, Result};

/// Where the module bytes come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleSource {
    Path(PathBuf),
    /// Fetched with a blocking GET; needs the `fetch` feature.
    Url(String),
    Bytes(Vec<u8>),
}

impl ModuleSource {
    /// Obtains the raw bytes. Nothing is validated yet.
    pub fn read(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            ModuleSource::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
            ModuleSource::Path(path) => std::fs::read(path).map(Cow::Owned).map_err(|err| {
                Error::SourceUnavailable(format!("failed to read {}: {err}", path.display()))
            }),
            ModuleSource::Url(url) => fetch(url).map(Cow::Owned),
        }
    }
}

#[cfg(feature = "fetch")]
fn fetch(url: &str) -> Result<Vec<u8>> {
    log::debug!("fetching module from {url}");
    reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes())
        .map(|bytes| bytes.to_vec())
        .map_err(|err| Error::SourceUnavailable(format!("failed to fetch {url}: {err}")))
}

#[cfg(not(feature = "fetch"))]
fn fetch(url: &str) -> Result<Vec<u8>> {
    Err(Error::SourceUnavailable(format!(
        "cannot fetch {url}: built without the `fetch` feature"
    )))
}

impl Display for ModuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleSource::Path(path) => write!(f, "{}", path.display()),
            ModuleSource::Url(url) => write!(f, "{url}"),
            ModuleSource::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl FromStr for ModuleSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("http://") || s.starts_with("https://") {
            Ok(ModuleSource::Url(s.to_string()))
        } else {
            Ok(ModuleSource::Path(s.into()))
        }
    }
}

impl From<&Path> for ModuleSource {
    fn from(path: &Path) -> Self {
        ModuleSource::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for ModuleSource {
    fn from(path: PathBuf) -> Self {
        ModuleSource::Path(path)
    }
}

impl From<Vec<u8>> for ModuleSource {
    fn from(bytes: Vec<u8>) -> Self {
        ModuleSource::Bytes(bytes)
    }
}

impl From<&[u8]> for ModuleSource {
    fn from(bytes: &[u8]) -> Self {
        ModuleSource::Bytes(bytes.to_vec())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WasmBinaryType {
    Module,
    Component,
}

impl WasmBinaryType {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if Parser::is_component(bytes) {
            Some(Self::Component)
        } else if Parser::is_core_wasm(bytes) {
            Some(Self::Module)
        } else {
            None
        }
    }
}

/// Returns the binary form of a core module, converting the text format
/// when the bytes don't start with the wasm magic.
pub(crate) fn module_bytes(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    if !bytes.starts_with(b"\0asm") {
        return wat::parse_bytes(bytes)
            .map(|bytes| Cow::Owned(bytes.into_owned()))
            .map_err(|err| Error::ModuleLoad(format!("not a wasm binary or text module: {err}")));
    }
    match WasmBinaryType::from_bytes(bytes) {
        Some(WasmBinaryType::Module) => Ok(Cow::Borrowed(bytes)),
        Some(WasmBinaryType::Component) => Err(Error::ModuleLoad(
            "components are not supported, expected a core module".into(),
        )),
        None => Err(Error::ModuleLoad("unknown wasm binary version".into())),
    }
}
