use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use lazy_static::lazy_static;

lazy_static! {
    static ref OUT_DIR: PathBuf = env_dir("OUT_DIR").unwrap();
    static ref MODULES_DIR: PathBuf = env_dir("CARGO_MANIFEST_DIR").unwrap().join("src/modules");
}

fn env_dir(key: &str) -> Result<PathBuf> {
    std::env::var_os(key)
        .map(PathBuf::from)
        .with_context(|| format!("{key} is not set"))
}

/// One file under `src/modules`, turned into a `TestModule` constant.
struct Fixture {
    ident: String,
    src: PathBuf,
    text: bool,
}

impl Fixture {
    fn from_path(src: PathBuf) -> Result<Self> {
        let text = match src.extension().and_then(|ext| ext.to_str()) {
            Some("wat") => true,
            Some("wasm") => false,
            _ => bail!("{src:?} is neither a .wat nor a .wasm file"),
        };
        let ident = const_name(&src)?;
        Ok(Self { ident, src, text })
    }

    /// Writes the binary next to the generated code and returns its path.
    fn emit_binary(&self) -> Result<PathBuf> {
        let file_name = self
            .src
            .file_name()
            .with_context(|| format!("{:?} has no file name", self.src))?;
        let dst = OUT_DIR.join(file_name).with_extension("wasm");
        if self.text {
            let bytes = wat::parse_file(&self.src)
                .with_context(|| format!("assembling {:?}", self.src))?;
            std::fs::write(&dst, bytes)?;
        } else {
            std::fs::copy(&self.src, &dst)?;
        }
        Ok(dst)
    }

    fn render(&self, out: &mut String) -> Result<()> {
        let dst = self.emit_binary()?;
        let source = if self.text {
            format!("Some(include_str!({:?}))", self.src)
        } else {
            "None".to_string()
        };
        writeln!(out, "pub const {}: TestModule = TestModule {{", self.ident)?;
        writeln!(out, "    source: {source},")?;
        writeln!(out, "    bytes: include_bytes!({dst:?}),")?;
        writeln!(out, "}};")?;
        Ok(())
    }
}

fn const_name(path: &Path) -> Result<String> {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| format!("{path:?} has no usable file stem"))?;
    if !stem.starts_with(|c: char| c.is_ascii_alphabetic()) {
        bail!("fixture names must start with a letter: {stem}");
    }
    Ok(stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect())
}

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed={}", MODULES_DIR.display());

    let mut paths = std::fs::read_dir(&*MODULES_DIR)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    // stable output regardless of directory order
    paths.sort();

    let mut generated = String::new();
    for path in paths {
        println!("cargo:rerun-if-changed={}", path.display());
        Fixture::from_path(path)?.render(&mut generated)?;
    }
    std::fs::write(OUT_DIR.join("modules.rs"), generated)?;
    Ok(())
}
