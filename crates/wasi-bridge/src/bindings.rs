//! The callable objects produced by export registration.

use std::sync::Arc;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    /// Runs on the calling thread against the session's own instance.
    Sync,
    /// Runs on a pool worker; the caller waits on a handle.
    Async,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    Constructor,
    Method,
    /// A static method or factory, e.g. `Fs.fromPath`.
    StaticMethod,
    Function,
}

/// A named, host-callable wrapper around one exported function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportBinding {
    name: Arc<str>,
    export: Arc<str>,
    mode: CallMode,
    kind: BindingKind,
}

impl ExportBinding {
    pub fn new(name: &str, export: &str, mode: CallMode, kind: BindingKind) -> Self {
        Self {
            name: name.into(),
            export: export.into(),
            mode,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the module export this binding calls.
    pub fn export(&self) -> &str {
        &self.export
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    pub fn kind(&self) -> BindingKind {
        self.kind
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassBinding {
    name: Arc<str>,
    constructor: Option<ExportBinding>,
    methods: Vec<ExportBinding>,
}

impl ClassBinding {
    pub(crate) fn new(name: &str, constructor: Option<ExportBinding>) -> Self {
        Self {
            name: name.into(),
            constructor,
            methods: Vec::new(),
        }
    }

    pub(crate) fn add_method(&mut self, method: ExportBinding) -> bool {
        if self.method(method.name()).is_ok() {
            return false;
        }
        self.methods.push(method);
        true
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constructor(&self) -> Option<&ExportBinding> {
        self.constructor.as_ref()
    }

    pub fn method(&self, name: &str) -> Result<&ExportBinding> {
        self.methods
            .iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| Error::NotFound(format!("{}.{name}", self.name)))
    }

    /// Methods in registration order.
    pub fn methods(&self) -> impl Iterator<Item = &ExportBinding> {
        self.methods.iter()
    }
}

/// Every class and free function a module registered, in registration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Namespace {
    classes: Vec<ClassBinding>,
    functions: Vec<ExportBinding>,
}

impl Namespace {
    pub fn class(&self, name: &str) -> Result<&ClassBinding> {
        self.classes
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::NotFound(format!("class {name}")))
    }

    pub(crate) fn class_mut(&mut self, name: &str) -> Option<&mut ClassBinding> {
        self.classes.iter_mut().find(|c| c.name() == name)
    }

    pub fn function(&self, name: &str) -> Result<&ExportBinding> {
        self.functions
            .iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| Error::NotFound(format!("function {name}")))
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassBinding> {
        self.classes.iter()
    }

    pub fn functions(&self) -> impl Iterator<Item = &ExportBinding> {
        self.functions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.functions.is_empty()
    }

    /// Every binding: constructors and methods class by class, then the
    /// free functions.
    pub fn bindings(&self) -> impl Iterator<Item = &ExportBinding> {
        self.classes
            .iter()
            .flat_map(|class| class.constructor().into_iter().chain(class.methods()))
            .chain(self.functions.iter())
    }

    pub fn has_async(&self) -> bool {
        self.bindings().any(|binding| binding.mode() == CallMode::Async)
    }

    /// Resolves `Class.method` or a free function name.
    pub fn lookup(&self, path: &str) -> Result<&ExportBinding> {
        match path.split_once('.') {
            Some((class, method)) => self.class(class)?.method(method),
            None => self.function(path),
        }
    }

    pub(crate) fn add_class(&mut self, class: ClassBinding) -> bool {
        if self.class(class.name()).is_ok() {
            return false;
        }
        self.classes.push(class);
        true
    }

    pub(crate) fn add_function(&mut self, function: ExportBinding) -> bool {
        if self.function(function.name()).is_ok() {
            return false;
        }
        self.functions.push(function);
        true
    }
}
