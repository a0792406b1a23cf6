//! Turning module aborts into errors that carry the native stack.

use std::fmt::{Display, Formatter};

use wasmtime::{Trap, WasmBacktrace};
use wasmtime_wasi::I32Exit;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// `proc_exit` was called.
    Exit(i32),
    /// The module trapped, e.g. `unreachable` from a panic.
    Trap(String),
    /// A host function failed.
    Host(String),
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Exit(code) => write!(f, "exit with code {code}"),
            AbortReason::Trap(msg) | AbortReason::Host(msg) => write!(f, "{msg}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceFrame {
    pub symbol: String,
    pub module: String,
    pub func_index: u32,
    pub offset: Option<usize>,
}

impl Display for TraceFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "at {} ({}[{}]", self.symbol, self.module, self.func_index)?;
        match self.offset {
            Some(offset) => write!(f, ":{offset:#x})"),
            None => write!(f, ")"),
        }
    }
}

/// The wasm frames active at the abort point, innermost first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeTrace {
    frames: Vec<TraceFrame>,
}

impl NativeTrace {
    pub fn capture(err: &anyhow::Error) -> Self {
        let Some(backtrace) = err.downcast_ref::<WasmBacktrace>() else {
            return Self::default();
        };
        let frames = backtrace
            .frames()
            .iter()
            .map(|frame| TraceFrame {
                symbol: frame
                    .func_name()
                    .map(demangle)
                    .unwrap_or_else(|| format!("<wasm function {}>", frame.func_index())),
                module: frame.module().name().unwrap_or("<module>").to_string(),
                func_index: frame.func_index(),
                offset: frame.module_offset(),
            })
            .collect();
        Self { frames }
    }

    pub fn frames(&self) -> &[TraceFrame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn demangle(name: &str) -> String {
    match rustc_demangle::try_demangle(name) {
        Ok(demangled) => format!("{demangled:#}"),
        Err(_) => name.to_string(),
    }
}

/// A module-internal fatal condition surfaced to the caller.
///
/// Renders as a header followed by one line per frame:
///
/// ```text
/// AbortSignal: wasm trap: wasm `unreachable` instruction executed
///     at abort_entry (native[4]:0x1a3)
///     at inner_call (native[5]:0x1b0)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbortSignal {
    pub reason: AbortReason,
    pub trace: NativeTrace,
}

impl AbortSignal {
    pub fn from_error(err: &anyhow::Error) -> Self {
        let reason = if let Some(exit) = err.downcast_ref::<I32Exit>() {
            AbortReason::Exit(exit.0)
        } else if let Some(trap) = err.downcast_ref::<Trap>() {
            AbortReason::Trap(format!("wasm trap: {trap}"))
        } else {
            AbortReason::Host(format!("{err:#}"))
        };
        Self {
            reason,
            trace: NativeTrace::capture(err),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.reason {
            AbortReason::Exit(code) => Some(code),
            _ => None,
        }
    }

    /// The trace lines, header first, each trimmed.
    pub fn lines(&self) -> Vec<String> {
        self.to_string()
            .lines()
            .map(|line| line.trim().to_string())
            .collect()
    }
}

impl Display for AbortSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AbortSignal: {}", self.reason)?;
        for frame in self.trace.frames() {
            write!(f, "\n    {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AbortSignal {}

#[cfg(test)]
mod tests {
    use wasmtime::{Engine, Instance, Module, Store};

    use super::*;

    fn abort_of(wat: &str, entry: &str) -> AbortSignal {
        let engine = Engine::default();
        let module = Module::new(&engine, wat).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[]).unwrap();
        let func = instance
            .get_typed_func::<(), ()>(&mut store, entry)
            .unwrap();
        let err = func.call(&mut store, ()).unwrap_err();
        AbortSignal::from_error(&err)
    }

    #[test]
    fn test_trap_trace_is_innermost_first() {
        let signal = abort_of(
            r#"(module $native
                (func $abort_entry unreachable)
                (func $inner_call call $abort_entry)
                (func (export "run") call $inner_call))"#,
            "run",
        );
        assert!(matches!(signal.reason, AbortReason::Trap(_)));
        let lines = signal.lines();
        assert!(lines[0].starts_with("AbortSignal: wasm trap"));
        assert!(lines[1].starts_with("at abort_entry (native[0]:0x"), "{lines:?}");
        assert!(lines[2].starts_with("at inner_call (native[1]:0x"), "{lines:?}");
        assert_eq!(signal.trace.frames().len(), 3);
    }

    #[test]
    fn test_rust_symbols_are_demangled() {
        let signal = abort_of(
            r#"(module
                (func $_ZN4core9panicking5panic17h0123456789abcdefE unreachable)
                (func (export "run") call $_ZN4core9panicking5panic17h0123456789abcdefE))"#,
            "run",
        );
        assert_eq!(signal.trace.frames()[0].symbol, "core::panicking::panic");
        assert_eq!(signal.trace.frames()[0].module, "<module>");
    }

    #[test]
    fn test_exit_and_host_reasons() {
        let signal = AbortSignal::from_error(&anyhow::Error::new(I32Exit(3)));
        assert_eq!(signal.exit_code(), Some(3));
        assert_eq!(signal.to_string(), "AbortSignal: exit with code 3");

        let signal = AbortSignal::from_error(&anyhow::anyhow!("host failed"));
        assert_eq!(signal.reason, AbortReason::Host("host failed".into()));
        assert!(signal.trace.is_empty());
    }
}
