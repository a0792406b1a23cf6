use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;
use wasmtime::Val;

use crate::bindings::{BindingKind, CallMode};
use crate::error::Error;
use crate::memory::PAGE_SIZE;
use crate::testing::BridgeTest;
use crate::testing::modules::*;

const SEED: &str = r#"{ "/": null, "/data/in.txt": "hello" }"#;

fn stateful() -> anyhow::Result<BridgeTest> {
    Ok(BridgeTest::builder()
        .with_module(STATEFUL_MODULE)
        .with_pool_size(1)
        .build()?)
}

fn native() -> anyhow::Result<BridgeTest> {
    Ok(BridgeTest::builder()
        .with_module(NATIVE_MODULE)
        .with_fs(SEED)?
        .build()?)
}

#[test]
fn test_hello_world() -> anyhow::Result<()> {
    let test = BridgeTest::builder().with_module(HELLO_WORLD).build()?;
    assert_eq!(test.session().run_start()?, 0);
    assert_eq!(test.stdout(), "hello world\n");
    Ok(())
}

#[test]
fn test_hello_world_from_path() -> anyhow::Result<()> {
    let test = BridgeTest::builder()
        .with_module_file(HELLO_WORLD)?
        .build()?;
    assert_eq!(test.session().run_start()?, 0);
    assert_eq!(test.stdout(), "hello world\n");
    Ok(())
}

#[test]
fn test_registered_namespace() -> anyhow::Result<()> {
    let test = native()?;
    let ns = test.session().namespace();

    let classes: Vec<_> = ns.classes().map(|c| c.name()).collect();
    assert_eq!(classes, ["Counter", "Fs"]);
    let functions: Vec<_> = ns.functions().map(|f| f.name()).collect();
    assert_eq!(functions, ["panic", "exit", "spawn", "slowAdd", "storeAsync"]);

    let counter = ns.class("Counter")?;
    assert_eq!(counter.constructor().map(|c| c.export()), Some("counter_new"));
    assert_eq!(counter.method("increment")?.mode(), CallMode::Async);
    assert_eq!(counter.method("get")?.mode(), CallMode::Sync);

    let fs = ns.class("Fs")?;
    assert!(fs.constructor().is_none());
    assert_eq!(fs.method("fromPath")?.kind(), BindingKind::StaticMethod);

    assert_eq!(
        test.session().registered_hooks(),
        [
            "__napi_register__Counter_struct_0",
            "__napi_register__Counter_impl_1",
            "__napi_register__Fs_struct_2",
            "__napi_register__Fs_impl_3",
            "__napi_register__panic_4",
            "__napi_register__exit_5",
            "__napi_register__spawn_6",
            "__napi_register__slowAdd_7",
            "__napi_register__storeAsync_8",
        ]
    );
    Ok(())
}

#[test]
fn test_registration_is_deterministic() -> anyhow::Result<()> {
    let first = native()?;
    let second = native()?;
    assert_ne!(first.session().session_id(), second.session().session_id());
    assert_eq!(first.session().namespace(), second.session().namespace());
    assert_eq!(
        first.session().registered_hooks(),
        second.session().registered_hooks()
    );
    Ok(())
}

#[test]
#[serial]
fn test_async_method_shares_memory_with_sync_method() -> anyhow::Result<()> {
    let test = native()?;
    test.session().construct("Counter", &[Val::I32(5)])?;
    assert_eq!(test.call_i32("Counter.increment", &[])?, 6);
    assert_eq!(test.call_i32("Counter.get", &[])?, 6);
    assert_eq!(test.session().workers().len(), 1);
    Ok(())
}

#[test]
#[serial]
fn test_async_write_is_visible_once_resolved() -> anyhow::Result<()> {
    let test = native()?;
    let session = test.session();
    let binding = session.namespace().function("storeAsync")?;
    let handle = session.call_async(binding, &[Val::I32(16384), Val::I32(1234)])?;
    handle.wait()?;
    let memory = session.memory().expect("shared memory");
    assert_eq!(memory.read_u32(16384)?, 1234);
    Ok(())
}

#[test]
#[serial]
fn test_single_worker_preserves_submission_order() -> anyhow::Result<()> {
    let test = BridgeTest::builder()
        .with_module(NATIVE_MODULE)
        .with_pool_size(1)
        .build()?;
    let session = test.session();
    let binding = session.namespace().function("slowAdd")?;
    let handles = (0..4)
        .map(|i| session.call_async(binding, &[Val::I32(i), Val::I32(10)]))
        .collect::<crate::Result<Vec<_>>>()?;
    let sums: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.wait().map(|results| results[0].unwrap_i32()))
        .collect::<crate::Result<_>>()?;
    assert_eq!(sums, [10, 11, 12, 13]);
    assert_eq!(session.workers().len(), 1);
    Ok(())
}

#[test]
fn test_abort_trace_starts_at_abort_entry() -> anyhow::Result<()> {
    let test = native()?;
    let err = test.call_i32("panic", &[]).unwrap_err();
    let signal = err.as_abort().expect("abort signal");
    let lines = signal.lines();
    assert!(lines[0].starts_with("AbortSignal: wasm trap"), "{lines:?}");
    assert!(lines[1].starts_with("at abort_entry (native["), "{lines:?}");
    assert!(lines[2].starts_with("at inner_call (native["), "{lines:?}");

    // the session survives an abort
    test.session().construct("Counter", &[Val::I32(1)])?;
    assert_eq!(test.call_i32("Counter.get", &[])?, 1);
    Ok(())
}

#[test]
fn test_proc_exit_is_an_abort_with_exit_code() -> anyhow::Result<()> {
    let test = native()?;
    let err = test.call_i32("exit", &[3]).unwrap_err();
    assert_eq!(err.as_abort().and_then(|s| s.exit_code()), Some(3));
    Ok(())
}

#[test]
fn test_vfs_round_trip_through_the_shim() -> anyhow::Result<()> {
    let test = native()?;
    assert_eq!(test.call_i32("Fs.roundTrip", &[])?, 7);
    assert_eq!(test.session().read_file("/data/out.txt")?, b"payload");
    Ok(())
}

#[test]
fn test_open_reads_seeded_file() -> anyhow::Result<()> {
    let test = native()?;
    test.poke(16384, b"data/in.txt")?;
    assert_eq!(test.call_i32("Fs.fromPath", &[16384, 11])?, 5);
    let mut buf = [0u8; 5];
    test.session().memory().expect("shared memory").read(12288, &mut buf)?;
    assert_eq!(&buf, b"hello");
    Ok(())
}

#[test]
fn test_missing_file_is_noent() -> anyhow::Result<()> {
    let test = native()?;
    test.poke(16384, b"nope.txt")?;
    assert_eq!(test.call_i32("Fs.fromPath", &[16384, 8])?, -44);
    Ok(())
}

#[test]
fn test_host_writes_are_visible_to_the_module() -> anyhow::Result<()> {
    let test = native()?;
    test.session().write_file("/data/in.txt", b"changed")?;
    test.poke(16384, b"data/in.txt")?;
    assert_eq!(test.call_i32("Fs.fromPath", &[16384, 11])?, 7);
    Ok(())
}

#[test]
#[serial]
fn test_thread_spawn_runs_thread_start_on_a_worker() -> anyhow::Result<()> {
    let test = native()?;
    let tid = test.call_i32("spawn", &[6144])?;
    assert!(tid >= 1, "tid = {tid}");

    let memory = test.session().memory().expect("shared memory");
    let deadline = Instant::now() + Duration::from_secs(10);
    while memory.read_u32(6144)? != tid as u32 {
        assert!(Instant::now() < deadline, "wasi_thread_start never ran");
        thread::sleep(Duration::from_millis(5));
    }

    let next = test.call_i32("spawn", &[6148])?;
    assert_eq!(next, tid + 1);
    Ok(())
}

#[test]
#[serial]
fn test_custom_worker_factory() -> anyhow::Result<()> {
    let spawned = Arc::new(AtomicUsize::new(0));
    let factory = {
        let spawned = spawned.clone();
        move |name: &str, body: Box<dyn FnOnce() + Send>| {
            spawned.fetch_add(1, Ordering::SeqCst);
            thread::Builder::new().name(name.to_string()).spawn(body)
        }
    };
    let test = BridgeTest::builder()
        .with_module(NATIVE_MODULE)
        .with_config(|config| config.on_create_worker(factory))
        .build()?;
    assert_eq!(test.call_i32("slowAdd", &[1, 2])?, 3);
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_missing_import_is_a_link_error() {
    let result = BridgeTest::builder().with_module(MISSING_IMPORT).build();
    assert!(matches!(result, Err(Error::Link(_))));
}

#[test]
fn test_failing_hook_is_a_registration_error() {
    let result = BridgeTest::builder().with_module(BAD_REGISTRATION).build();
    match result {
        Err(Error::Registration { hook, .. }) => {
            assert_eq!(hook, "__napi_register__Nope_impl_0")
        }
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("registration should fail"),
    }
}

#[test]
fn test_explicit_hook_list() -> anyhow::Result<()> {
    let test = BridgeTest::builder()
        .with_module(NATIVE_MODULE)
        .with_config(|config| {
            config.with_registration_hooks([
                "__napi_register__Fs_struct_2",
                "__napi_register__Fs_impl_3",
                "__napi_register__not_exported_9",
            ])
        })
        .build()?;
    let ns = test.session().namespace();
    assert!(ns.class("Fs").is_ok());
    assert!(ns.class("Counter").is_err());
    assert_eq!(test.session().registered_hooks().len(), 2);
    Ok(())
}

#[test]
fn test_before_init_can_register_early() -> anyhow::Result<()> {
    let seen = Arc::new(AtomicUsize::new(0));
    let test = {
        let seen = seen.clone();
        BridgeTest::builder()
            .with_module(NATIVE_MODULE)
            .with_config(move |config| {
                config.before_init(move |ctx| {
                    seen.store(ctx.hooks().count(), Ordering::SeqCst);
                    assert!(ctx.memory().is_some());
                    ctx.register_exports()?;
                    assert!(ctx.register_exports().is_err());
                    Ok(())
                })
            })
            .build()?
    };
    assert_eq!(seen.load(Ordering::SeqCst), 9);
    assert_eq!(test.session().registered_hooks().len(), 9);
    assert!(test.session().namespace().class("Counter").is_ok());
    Ok(())
}

#[test]
fn test_before_init_failure_aborts_the_load() {
    let result = BridgeTest::builder()
        .with_module(NATIVE_MODULE)
        .with_config(|config| config.before_init(|_| anyhow::bail!("not today")))
        .build();
    match result {
        Err(Error::Registration { hook, reason }) => {
            assert_eq!(hook, "beforeInit");
            assert!(reason.contains("not today"));
        }
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("load should fail"),
    }
}

#[test]
fn test_reference_arguments_are_rejected() -> anyhow::Result<()> {
    let test = native()?;
    let binding = test.session().namespace().lookup("Counter.get")?;
    let result = test.session().call(binding, &[Val::FuncRef(None)]);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    let result = test.session().call_method("Counter", "missing", &[]);
    assert!(matches!(result, Err(Error::NotFound(_))));
    Ok(())
}

#[test]
#[serial]
fn test_worker_sees_memory_written_before_it_started() -> anyhow::Result<()> {
    let test = stateful()?;
    assert!(test.session().workers().is_empty());
    test.call_i32("set", &[42])?;
    assert_eq!(test.call_i32("get", &[])?, 42);
    assert_eq!(test.session().memory().expect("shared memory").read_u32(4096)?, 42);
    Ok(())
}

#[test]
#[serial]
fn test_data_segments_are_applied_before_the_module_runs() -> anyhow::Result<()> {
    let test = stateful()?;
    assert_eq!(test.call_i32("get", &[])?, 5);
    Ok(())
}

#[test]
#[serial]
fn test_workers_get_their_own_stack_and_tls() -> anyhow::Result<()> {
    let test = stateful()?;
    assert_eq!(test.call_i32("stackTopSync", &[])?, 16384);

    let top = u64::from(test.call_i32("stackTop", &[])? as u32);
    let tls = u64::from(test.call_i32("tlsBase", &[])? as u32);
    assert!(top >= 17 * PAGE_SIZE, "{top:#x}");
    assert_eq!(top % 16, 0);
    assert!(tls >= 17 * PAGE_SIZE && tls < top, "{tls:#x}");
    assert_eq!(tls % 16, 0);
    assert!(test.session().memory().expect("shared memory").size_pages() > 17);

    // the main instance keeps its own
    assert_eq!(test.call_i32("stackTopSync", &[])?, 16384);
    Ok(())
}

#[test]
#[serial]
fn test_sync_and_async_frames_do_not_overlap() -> anyhow::Result<()> {
    let test = stateful()?;
    let session = test.session();
    let memory = session.memory().expect("shared memory");
    let handle = session.call_async(session.namespace().function("hold")?, &[Val::I32(7)])?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while memory.read_u32(6404)? == 0 {
        assert!(Instant::now() < deadline, "hold never wrote its frame");
        thread::sleep(Duration::from_millis(1));
    }
    test.call_i32("clobber", &[9])?;
    assert_eq!(handle.wait()?[0].unwrap_i32(), 7);
    Ok(())
}

const HIDDEN_STACK: &str = r#"(module
    (import "env" "memory" (memory 1 65536 shared))
    (import "bridge" "define_function"
        (func $define_function (param i32 i32 i32 i32 i32) (result i32)))
    (global $__stack_pointer (mut i32) (i32.const 4096))
    (data (i32.const 256) "work")
    (func (export "__napi_register__work_0")
        (drop (call $define_function
            (i32.const 256) (i32.const 4) (i32.const 256) (i32.const 4) (i32.const MODE))))
    (func (export "work") (result i32) global.get $__stack_pointer))"#;

#[test]
fn test_hidden_stack_pointer_rejects_async_bindings() -> anyhow::Result<()> {
    let result = BridgeTest::builder()
        .with_module(HIDDEN_STACK.replace("MODE", "1"))
        .build();
    match result {
        Err(Error::Link(reason)) => assert!(reason.contains("__stack_pointer"), "{reason}"),
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("load should fail"),
    }

    let test = BridgeTest::builder()
        .with_module(HIDDEN_STACK.replace("MODE", "0"))
        .build()?;
    assert_eq!(test.call_i32("work", &[])?, 4096);
    Ok(())
}
