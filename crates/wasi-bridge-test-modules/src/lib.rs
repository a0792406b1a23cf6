//! Wasm fixtures for the wasi-bridge tests, compiled from `src/modules` at
//! build time. Each module is exposed as a constant named after its file.

pub struct TestModule {
    pub source: Option<&'static str>,
    pub bytes: &'static [u8],
}

impl TestModule {
    /// An owned copy of the compiled bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl AsRef<[u8]> for TestModule {
    fn as_ref(&self) -> &[u8] {
        self.bytes
    }
}

include!(concat!(env!("OUT_DIR"), "/modules.rs"));
