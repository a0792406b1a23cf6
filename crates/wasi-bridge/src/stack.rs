//! Shadow stacks for worker instances.
//!
//! LLVM keeps a module's C stack in linear memory and points at it with the
//! `__stack_pointer` global. Globals are per instance but start from the
//! module's initializers, so every worker would otherwise push frames into
//! the main instance's stack. Each worker gets pages of its own before it
//! runs any work.

use wasmparser::{KnownCustom, Name, Parser, Payload};
use wasmtime::{AsContextMut, ExternType, Instance, Module, Mutability, Val};

use crate::error::{Error, Result};
use crate::memory::{PAGE_SIZE, SharedLinearMemory};

pub const STACK_POINTER: &str = "__stack_pointer";
pub const TLS_BASE: &str = "__tls_base";
pub const TLS_SIZE: &str = "__tls_size";
pub const TLS_ALIGN: &str = "__tls_align";
pub const INIT_TLS: &str = "__wasm_init_tls";

const STACK_ALIGN: u64 = 16;

/// How a module keeps its shadow stack pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackPointer {
    /// No `__stack_pointer` global.
    Absent,
    /// A mutable global exported as `__stack_pointer`, movable by the host.
    Exported,
    /// A `__stack_pointer` the module keeps to itself. Workers cannot be
    /// given their own stack.
    Internal,
}

impl StackPointer {
    /// `bytes` are the binary `module` was compiled from; the name section is
    /// the only place an unexported stack pointer shows up.
    pub fn detect(module: &Module, bytes: &[u8]) -> Self {
        let exported = module.exports().any(|export| {
            export.name() == STACK_POINTER
                && matches!(export.ty(), ExternType::Global(ty) if ty.mutability() == Mutability::Var)
        });
        if exported {
            Self::Exported
        } else if has_named_global(bytes, STACK_POINTER) {
            Self::Internal
        } else {
            Self::Absent
        }
    }
}

fn has_named_global(bytes: &[u8], wanted: &str) -> bool {
    for payload in Parser::new(0).parse_all(bytes) {
        let Ok(Payload::CustomSection(reader)) = payload else {
            continue;
        };
        let KnownCustom::Name(names) = reader.as_known() else {
            continue;
        };
        for name in names.into_iter().flatten() {
            if let Name::Global(map) = name {
                if map.into_iter().flatten().any(|naming| naming.name == wanted) {
                    return true;
                }
            }
        }
    }
    false
}

fn global_u64(mut store: impl AsContextMut, instance: &Instance, name: &str) -> Option<u64> {
    let global = instance.get_global(&mut store, name)?;
    match global.get(&mut store) {
        Val::I32(value) => Some(u64::from(value as u32)),
        Val::I64(value) => u64::try_from(value).ok(),
        _ => None,
    }
}

fn set_global(mut store: impl AsContextMut, instance: &Instance, name: &str, value: u64) -> Result<()> {
    let Some(global) = instance.get_global(&mut store, name) else {
        return Ok(());
    };
    let value = u32::try_from(value)
        .map_err(|_| Error::Link(format!("{name} value {value:#x} is outside a 32-bit memory")))?;
    global
        .set(&mut store, Val::I32(value as i32))
        .map_err(|err| Error::Link(format!("cannot set {name}: {err:#}")))
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// The stack and TLS block a worker instance owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerStack {
    stack_pointer: u64,
    tls_base: Option<u64>,
}

impl WorkerStack {
    /// Grows `memory` by enough pages for a `stack_size` stack plus the
    /// module's TLS block, initializes the block through `__wasm_init_tls`
    /// and points `__stack_pointer` at the top of the new stack.
    pub(crate) fn install(
        mut store: impl AsContextMut,
        instance: &Instance,
        memory: &SharedLinearMemory,
        stack_size: u64,
    ) -> Result<Self> {
        let init_tls = instance
            .get_typed_func::<i32, ()>(&mut store, INIT_TLS)
            .ok();
        let tls = match (&init_tls, global_u64(&mut store, instance, TLS_SIZE)) {
            (Some(_), Some(size)) => {
                let align = global_u64(&mut store, instance, TLS_ALIGN)
                    .filter(|align| align.is_power_of_two())
                    .unwrap_or(STACK_ALIGN);
                Some((size, align))
            }
            _ => None,
        };
        let reserve = tls.map_or(0, |(size, align)| size + align);
        let pages = (stack_size + reserve).div_ceil(PAGE_SIZE);
        let base = memory
            .grow(pages)
            .map_err(|err| Error::Link(format!("no room for a worker stack: {err}")))?
            * PAGE_SIZE;
        let end = base + pages * PAGE_SIZE;

        let tls_base = match (init_tls, tls) {
            (Some(init_tls), Some((_, align))) => {
                let tls_base = align_up(base, align);
                let arg = u32::try_from(tls_base)
                    .map_err(|_| Error::Link(format!("TLS block at {tls_base:#x} is outside a 32-bit memory")))?;
                init_tls
                    .call(&mut store, arg as i32)
                    .map_err(|err| Error::Link(format!("{INIT_TLS} failed: {err:#}")))?;
                Some(tls_base)
            }
            _ => None,
        };

        // highest aligned address inside the region, so the top of a full
        // 4 GiB memory still fits in an i32
        let stack = Self {
            stack_pointer: end - STACK_ALIGN,
            tls_base,
        };
        stack.enter(&mut store, instance)?;
        Ok(stack)
    }

    /// Points the instance back at this stack and TLS block, in case a
    /// thread entry moved them.
    pub(crate) fn enter(&self, mut store: impl AsContextMut, instance: &Instance) -> Result<()> {
        set_global(&mut store, instance, STACK_POINTER, self.stack_pointer)?;
        if let Some(tls_base) = self.tls_base {
            let mutable = instance
                .get_global(&mut store, TLS_BASE)
                .is_some_and(|global| global.ty(&store).mutability() == Mutability::Var);
            if mutable {
                set_global(&mut store, instance, TLS_BASE, tls_base)?;
            }
        }
        Ok(())
    }

    pub fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    pub fn tls_base(&self) -> Option<u64> {
        self.tls_base
    }
}
