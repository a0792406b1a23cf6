//! Export registration.
//!
//! A module exposes its native types through registration hooks: argument-less
//! exports named `__napi_register__<Type>_struct_<n>`,
//! `__napi_register__<Type>_impl_<n>` or `__napi_register__<function>_<n>`.
//! Each hook runs once after instantiation and describes what it registers by
//! calling back into the `bridge` import namespace:
//!
//! | import            | signature                                               |
//! |-------------------|---------------------------------------------------------|
//! | `define_class`    | `(name, name_len, ctor, ctor_len) -> i32`               |
//! | `define_method`   | `(class, class_len, name, name_len, export, export_len, flags) -> i32` |
//! | `define_function` | `(name, name_len, export, export_len, flags) -> i32`    |
//!
//! `flags` bit 0 marks an async binding, bit 1 a static method. The return
//! value is `0` or one of the negative codes below.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use wasmtime::{AsContextMut, Caller, Extern, Instance, Linker, Module, Store, TypedFunc};

use crate::bindings::{BindingKind, CallMode, ClassBinding, ExportBinding, Namespace};
use crate::error::{Error, Result};
use crate::host::HostState;
use crate::memory::with_memory;
use crate::trace::AbortSignal;

pub const HOOK_PREFIX: &str = "__napi_register__";
pub const BRIDGE_MODULE: &str = "bridge";

pub const OK: i32 = 0;
pub const ERR_BAD_INPUT: i32 = -1;
pub const ERR_UNKNOWN_CLASS: i32 = -2;
pub const ERR_DUPLICATE: i32 = -3;
pub const ERR_CLOSED: i32 = -4;

pub const FLAG_ASYNC: i32 = 1 << 0;
pub const FLAG_STATIC: i32 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    Struct,
    Impl,
    Function,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookDescriptor {
    pub name: String,
    pub kind: HookKind,
    pub type_name: String,
    pub ordinal: u32,
}

impl HookDescriptor {
    /// Parses a hook export name, `None` if it doesn't follow the convention.
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(HOOK_PREFIX)?;
        let (stem, ordinal) = rest.rsplit_once('_')?;
        let ordinal = ordinal.parse().ok()?;
        let (kind, type_name) = if let Some(ty) = stem.strip_suffix("_struct") {
            (HookKind::Struct, ty)
        } else if let Some(ty) = stem.strip_suffix("_impl") {
            (HookKind::Impl, ty)
        } else {
            (HookKind::Function, stem)
        };
        if type_name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            kind,
            type_name: type_name.to_string(),
            ordinal,
        })
    }

    fn explicit(name: &str, position: usize) -> Self {
        Self::parse(name).unwrap_or_else(|| Self {
            name: name.to_string(),
            kind: HookKind::Function,
            type_name: name.to_string(),
            ordinal: position as u32,
        })
    }
}

/// The hooks to run for `module`: the explicit list as given, or the hooks
/// found in the export table in registration order.
pub fn discover(module: &Module, explicit: Option<&[String]>) -> Vec<HookDescriptor> {
    match explicit {
        Some(names) => names
            .iter()
            .enumerate()
            .map(|(position, name)| HookDescriptor::explicit(name, position))
            .collect(),
        None => order_hooks(
            module
                .exports()
                .filter(|export| export.ty().func().is_some())
                .filter_map(|export| HookDescriptor::parse(export.name()))
                .collect(),
        ),
    }
}

/// Sorts by ordinal, keeping export order for ties, and moves a type's struct
/// hook in front of its first impl hook.
pub fn order_hooks(mut hooks: Vec<HookDescriptor>) -> Vec<HookDescriptor> {
    hooks.sort_by_key(|hook| hook.ordinal);
    let mut pending: Vec<Option<HookDescriptor>> = hooks.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(pending.len());
    for i in 0..pending.len() {
        let Some(hook) = pending[i].take() else {
            continue;
        };
        if hook.kind == HookKind::Impl {
            let late_struct = pending[i + 1..].iter_mut().find(|later| {
                matches!(later, Some(h) if h.kind == HookKind::Struct && h.type_name == hook.type_name)
            });
            if let Some(late_struct) = late_struct.and_then(Option::take) {
                ordered.push(late_struct);
            }
        }
        ordered.push(hook);
    }
    ordered
}

#[derive(Clone)]
pub enum ResolvedHook {
    Present(TypedFunc<(), ()>),
    Absent,
}

impl std::fmt::Debug for ResolvedHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedHook::Present(_) => write!(f, "Present"),
            ResolvedHook::Absent => write!(f, "Absent"),
        }
    }
}

/// Looks every hook up once. A missing export is `Absent`, an export with
/// the wrong type is an error.
pub fn resolve(
    mut store: impl AsContextMut,
    instance: &Instance,
    hooks: &[HookDescriptor],
) -> Result<Vec<ResolvedHook>> {
    hooks
        .iter()
        .map(|hook| match instance.get_export(&mut store, &hook.name) {
            None => Ok(ResolvedHook::Absent),
            Some(Extern::Func(func)) => func
                .typed::<(), ()>(&store)
                .map(ResolvedHook::Present)
                .map_err(|err| Error::Registration {
                    hook: hook.name.clone(),
                    reason: format!("unexpected signature: {err}"),
                }),
            Some(_) => Err(Error::Registration {
                hook: hook.name.clone(),
                reason: "export is not a function".into(),
            }),
        })
        .collect()
}

/// The resolved hooks of one session, run at most once.
pub struct Registration {
    hooks: Vec<(HookDescriptor, ResolvedHook)>,
    invoked: Option<Vec<String>>,
}

impl Registration {
    pub fn new(hooks: Vec<HookDescriptor>, resolved: Vec<ResolvedHook>) -> Self {
        Self {
            hooks: hooks.into_iter().zip(resolved).collect(),
            invoked: None,
        }
    }

    pub fn hooks(&self) -> impl Iterator<Item = (&HookDescriptor, &ResolvedHook)> {
        self.hooks.iter().map(|(hook, resolved)| (hook, resolved))
    }

    pub fn has_run(&self) -> bool {
        self.invoked.is_some()
    }

    /// Calls every present hook in order. Fails on a second call.
    pub fn run(&mut self, store: &mut Store<HostState>) -> Result<()> {
        if self.has_run() {
            return Err(Error::Registration {
                hook: "*".into(),
                reason: "registration hooks already ran for this session".into(),
            });
        }
        let mut invoked = Vec::new();
        for (hook, resolved) in &self.hooks {
            let ResolvedHook::Present(func) = resolved else {
                log::debug!("registration hook {} is not exported, skipping", hook.name);
                continue;
            };
            log::debug!("running registration hook {}", hook.name);
            func.call(&mut *store, ()).map_err(|err| Error::Registration {
                hook: hook.name.clone(),
                reason: AbortSignal::from_error(&err).to_string(),
            })?;
            invoked.push(hook.name.clone());
        }
        self.invoked = Some(invoked);
        Ok(())
    }

    /// Names of the hooks that ran, in order.
    pub fn invoked(&self) -> &[String] {
        self.invoked.as_deref().unwrap_or_default()
    }
}

/// Collects the bindings hooks define while registration is open.
#[derive(Clone, Default)]
pub struct Registrar {
    inner: Arc<Mutex<RegistrarState>>,
}

#[derive(Default)]
struct RegistrarState {
    open: bool,
    namespace: Namespace,
}

fn mode(flags: i32) -> CallMode {
    if flags & FLAG_ASYNC != 0 {
        CallMode::Async
    } else {
        CallMode::Sync
    }
}

impl Registrar {
    pub fn open() -> Self {
        let registrar = Self::default();
        registrar.lock().open = true;
        registrar
    }

    fn lock(&self) -> MutexGuard<'_, RegistrarState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn define_class(&self, name: &str, constructor: Option<&str>) -> i32 {
        let mut state = self.lock();
        if !state.open {
            return ERR_CLOSED;
        }
        let constructor = constructor.map(|export| {
            ExportBinding::new("constructor", export, CallMode::Sync, BindingKind::Constructor)
        });
        match state.namespace.add_class(ClassBinding::new(name, constructor)) {
            true => OK,
            false => ERR_DUPLICATE,
        }
    }

    pub fn define_method(&self, class: &str, name: &str, export: &str, flags: i32) -> i32 {
        let mut state = self.lock();
        if !state.open {
            return ERR_CLOSED;
        }
        let Some(class) = state.namespace.class_mut(class) else {
            return ERR_UNKNOWN_CLASS;
        };
        let kind = if flags & FLAG_STATIC != 0 {
            BindingKind::StaticMethod
        } else {
            BindingKind::Method
        };
        match class.add_method(ExportBinding::new(name, export, mode(flags), kind)) {
            true => OK,
            false => ERR_DUPLICATE,
        }
    }

    pub fn define_function(&self, name: &str, export: &str, flags: i32) -> i32 {
        let mut state = self.lock();
        if !state.open {
            return ERR_CLOSED;
        }
        let binding = ExportBinding::new(name, export, mode(flags), BindingKind::Function);
        match state.namespace.add_function(binding) {
            true => OK,
            false => ERR_DUPLICATE,
        }
    }

    /// Ends the registration phase and returns what was registered.
    pub fn close(&self) -> Namespace {
        let mut state = self.lock();
        state.open = false;
        state.namespace.clone()
    }
}

/// Defines the `bridge` imports hooks call back into.
pub fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        BRIDGE_MODULE,
        "define_class",
        |mut caller: Caller<'_, HostState>, name: i32, name_len: i32, ctor: i32, ctor_len: i32| {
            with_memory(&mut caller, |mem, host| {
                let Ok(name) = mem.read_str(name as u32, name_len as u32) else {
                    return ERR_BAD_INPUT;
                };
                let ctor = match ctor_len {
                    0 => None,
                    len => match mem.read_str(ctor as u32, len as u32) {
                        Ok(ctor) => Some(ctor),
                        Err(_) => return ERR_BAD_INPUT,
                    },
                };
                host.registrar().define_class(&name, ctor.as_deref())
            })
        },
    )?;
    linker.func_wrap(
        BRIDGE_MODULE,
        "define_method",
        |mut caller: Caller<'_, HostState>,
         class: i32,
         class_len: i32,
         name: i32,
         name_len: i32,
         export: i32,
         export_len: i32,
         flags: i32| {
            with_memory(&mut caller, |mem, host| {
                let strings = (
                    mem.read_str(class as u32, class_len as u32),
                    mem.read_str(name as u32, name_len as u32),
                    mem.read_str(export as u32, export_len as u32),
                );
                let (Ok(class), Ok(name), Ok(export)) = strings else {
                    return ERR_BAD_INPUT;
                };
                host.registrar().define_method(&class, &name, &export, flags)
            })
        },
    )?;
    linker.func_wrap(
        BRIDGE_MODULE,
        "define_function",
        |mut caller: Caller<'_, HostState>,
         name: i32,
         name_len: i32,
         export: i32,
         export_len: i32,
         flags: i32| {
            with_memory(&mut caller, |mem, host| {
                let strings = (
                    mem.read_str(name as u32, name_len as u32),
                    mem.read_str(export as u32, export_len as u32),
                );
                let (Ok(name), Ok(export)) = strings else {
                    return ERR_BAD_INPUT;
                };
                host.registrar().define_function(&name, &export, flags)
            })
        },
    )?;
    Ok(())
}
