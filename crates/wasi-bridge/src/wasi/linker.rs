use wasmtime::{Caller, Linker};
use wasmtime_wasi::I32Exit;

use super::{Errno, WASI_MODULE, WasiCtx, WasiView};
use crate::memory::{MemView, MemoryView, with_memory};

fn errno(result: Result<(), Errno>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(errno) => errno.raw(),
    }
}

fn ret(result: Result<(), Errno>) -> anyhow::Result<i32> {
    Ok(errno(result))
}

fn unsupported() -> anyhow::Result<i32> {
    Ok(Errno::Notsup.raw())
}

fn syscall<T>(
    caller: &mut Caller<'_, T>,
    f: impl FnOnce(&WasiCtx, &mut MemView<'_>) -> Result<(), Errno>,
) -> anyhow::Result<i32>
where
    T: WasiView + MemoryView + 'static,
{
    with_memory(caller, |mem, data| errno(f(data.ctx(), mem)))
}

/// Defines every `wasi_snapshot_preview1` import on `linker`.
pub fn add_to_linker<T>(linker: &mut Linker<T>) -> anyhow::Result<()>
where
    T: WasiView + MemoryView + 'static,
{
    let m = WASI_MODULE;

    linker.func_wrap(m, "args_get", |mut caller: Caller<'_, T>, argv: i32, buf: i32| {
        syscall(&mut caller, |ctx, mem| ctx.args_get(mem, argv as u32, buf as u32))
    })?;
    linker.func_wrap(m, "args_sizes_get", |mut caller: Caller<'_, T>, argc: i32, size: i32| {
        syscall(&mut caller, |ctx, mem| ctx.args_sizes_get(mem, argc as u32, size as u32))
    })?;
    linker.func_wrap(m, "environ_get", |mut caller: Caller<'_, T>, env: i32, buf: i32| {
        syscall(&mut caller, |ctx, mem| ctx.environ_get(mem, env as u32, buf as u32))
    })?;
    linker.func_wrap(m, "environ_sizes_get", |mut caller: Caller<'_, T>, count: i32, size: i32| {
        syscall(&mut caller, |ctx, mem| ctx.environ_sizes_get(mem, count as u32, size as u32))
    })?;

    linker.func_wrap(m, "clock_res_get", |mut caller: Caller<'_, T>, id: i32, res: i32| {
        syscall(&mut caller, |ctx, mem| ctx.clock_res_get(mem, id as u32, res as u32))
    })?;
    linker.func_wrap(
        m,
        "clock_time_get",
        |mut caller: Caller<'_, T>, id: i32, _precision: i64, time: i32| {
            syscall(&mut caller, |ctx, mem| ctx.clock_time_get(mem, id as u32, time as u32))
        },
    )?;

    linker.func_wrap(
        m,
        "fd_advise",
        |caller: Caller<'_, T>, fd: i32, _offset: i64, _len: i64, _advice: i32| {
            ret(caller.data().ctx().fd_advise(fd as u32))
        },
    )?;
    linker.func_wrap(
        m,
        "fd_allocate",
        |caller: Caller<'_, T>, fd: i32, offset: i64, len: i64| {
            ret(caller.data().ctx().fd_allocate(fd as u32, offset as u64, len as u64))
        },
    )?;
    linker.func_wrap(m, "fd_close", |caller: Caller<'_, T>, fd: i32| {
        ret(caller.data().ctx().fd_close(fd as u32))
    })?;
    linker.func_wrap(m, "fd_datasync", |caller: Caller<'_, T>, fd: i32| {
        ret(caller.data().ctx().fd_sync(fd as u32))
    })?;
    linker.func_wrap(m, "fd_sync", |caller: Caller<'_, T>, fd: i32| {
        ret(caller.data().ctx().fd_sync(fd as u32))
    })?;
    linker.func_wrap(m, "fd_fdstat_get", |mut caller: Caller<'_, T>, fd: i32, ptr: i32| {
        syscall(&mut caller, |ctx, mem| ctx.fd_fdstat_get(mem, fd as u32, ptr as u32))
    })?;
    linker.func_wrap(m, "fd_fdstat_set_flags", |caller: Caller<'_, T>, fd: i32, flags: i32| {
        ret(caller.data().ctx().fd_fdstat_set_flags(fd as u32, flags as u16))
    })?;
    linker.func_wrap(
        m,
        "fd_fdstat_set_rights",
        |caller: Caller<'_, T>, fd: i32, base: i64, inheriting: i64| {
            let ctx = caller.data().ctx();
            ret(ctx.fd_fdstat_set_rights(fd as u32, base as u64, inheriting as u64))
        },
    )?;
    linker.func_wrap(m, "fd_filestat_get", |mut caller: Caller<'_, T>, fd: i32, ptr: i32| {
        syscall(&mut caller, |ctx, mem| ctx.fd_filestat_get(mem, fd as u32, ptr as u32))
    })?;
    linker.func_wrap(m, "fd_filestat_set_size", |caller: Caller<'_, T>, fd: i32, size: i64| {
        ret(caller.data().ctx().fd_filestat_set_size(fd as u32, size as u64))
    })?;
    linker.func_wrap(
        m,
        "fd_filestat_set_times",
        |caller: Caller<'_, T>, fd: i32, atim: i64, mtim: i64, flags: i32| {
            let ctx = caller.data().ctx();
            ret(ctx.fd_filestat_set_times(
                fd as u32,
                atim as u64,
                mtim as u64,
                flags as u16,
            ))
        },
    )?;
    linker.func_wrap(
        m,
        "fd_pread",
        |mut caller: Caller<'_, T>, fd: i32, iovs: i32, len: i32, offset: i64, nread: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.fd_pread(mem, fd as u32, iovs as u32, len as u32, offset as u64, nread as u32)
            })
        },
    )?;
    linker.func_wrap(m, "fd_prestat_get", |mut caller: Caller<'_, T>, fd: i32, ptr: i32| {
        syscall(&mut caller, |ctx, mem| ctx.fd_prestat_get(mem, fd as u32, ptr as u32))
    })?;
    linker.func_wrap(
        m,
        "fd_prestat_dir_name",
        |mut caller: Caller<'_, T>, fd: i32, path: i32, len: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.fd_prestat_dir_name(mem, fd as u32, path as u32, len as u32)
            })
        },
    )?;
    linker.func_wrap(
        m,
        "fd_pwrite",
        |mut caller: Caller<'_, T>, fd: i32, iovs: i32, len: i32, offset: i64, nwritten: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.fd_pwrite(mem, fd as u32, iovs as u32, len as u32, offset as u64, nwritten as u32)
            })
        },
    )?;
    linker.func_wrap(
        m,
        "fd_read",
        |mut caller: Caller<'_, T>, fd: i32, iovs: i32, len: i32, nread: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.fd_read(mem, fd as u32, iovs as u32, len as u32, nread as u32)
            })
        },
    )?;
    linker.func_wrap(
        m,
        "fd_readdir",
        |mut caller: Caller<'_, T>, fd: i32, buf: i32, len: i32, cookie: i64, used: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.fd_readdir(mem, fd as u32, buf as u32, len as u32, cookie as u64, used as u32)
            })
        },
    )?;
    linker.func_wrap(m, "fd_renumber", |caller: Caller<'_, T>, from: i32, to: i32| {
        ret(caller.data().ctx().fd_renumber(from as u32, to as u32))
    })?;
    linker.func_wrap(
        m,
        "fd_seek",
        |mut caller: Caller<'_, T>, fd: i32, delta: i64, whence: i32, newoffset: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.fd_seek(mem, fd as u32, delta, whence as u8, newoffset as u32)
            })
        },
    )?;
    linker.func_wrap(m, "fd_tell", |mut caller: Caller<'_, T>, fd: i32, ptr: i32| {
        syscall(&mut caller, |ctx, mem| ctx.fd_tell(mem, fd as u32, ptr as u32))
    })?;
    linker.func_wrap(
        m,
        "fd_write",
        |mut caller: Caller<'_, T>, fd: i32, iovs: i32, len: i32, nwritten: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.fd_write(mem, fd as u32, iovs as u32, len as u32, nwritten as u32)
            })
        },
    )?;

    linker.func_wrap(
        m,
        "path_create_directory",
        |mut caller: Caller<'_, T>, fd: i32, path: i32, len: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.path_create_directory(mem, fd as u32, path as u32, len as u32)
            })
        },
    )?;
    linker.func_wrap(
        m,
        "path_filestat_get",
        |mut caller: Caller<'_, T>, fd: i32, _flags: i32, path: i32, len: i32, buf: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.path_filestat_get(mem, fd as u32, path as u32, len as u32, buf as u32)
            })
        },
    )?;
    linker.func_wrap(
        m,
        "path_filestat_set_times",
        |mut caller: Caller<'_, T>,
         fd: i32,
         _flags: i32,
         path: i32,
         len: i32,
         atim: i64,
         mtim: i64,
         fst_flags: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.path_filestat_set_times(
                    mem,
                    fd as u32,
                    path as u32,
                    len as u32,
                    atim as u64,
                    mtim as u64,
                    fst_flags as u16,
                )
            })
        },
    )?;
    linker.func_wrap(
        m,
        "path_link",
        |_: Caller<'_, T>, _: i32, _: i32, _: i32, _: i32, _: i32, _: i32, _: i32| {
            unsupported()
        },
    )?;
    linker.func_wrap(
        m,
        "path_open",
        |mut caller: Caller<'_, T>,
         fd: i32,
         _dirflags: i32,
         path: i32,
         len: i32,
         oflags: i32,
         rights_base: i64,
         rights_inheriting: i64,
         fdflags: i32,
         opened: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.path_open(
                    mem,
                    fd as u32,
                    path as u32,
                    len as u32,
                    oflags as u16,
                    rights_base as u64,
                    rights_inheriting as u64,
                    fdflags as u16,
                    opened as u32,
                )
            })
        },
    )?;
    linker.func_wrap(
        m,
        "path_readlink",
        |mut caller: Caller<'_, T>, fd: i32, path: i32, len: i32, _buf: i32, _buf_len: i32, _used: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.path_readlink(mem, fd as u32, path as u32, len as u32)
            })
        },
    )?;
    linker.func_wrap(
        m,
        "path_remove_directory",
        |mut caller: Caller<'_, T>, fd: i32, path: i32, len: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.path_remove_directory(mem, fd as u32, path as u32, len as u32)
            })
        },
    )?;
    linker.func_wrap(
        m,
        "path_rename",
        |mut caller: Caller<'_, T>,
         old_fd: i32,
         old_path: i32,
         old_len: i32,
         new_fd: i32,
         new_path: i32,
         new_len: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.path_rename(
                    mem,
                    old_fd as u32,
                    old_path as u32,
                    old_len as u32,
                    new_fd as u32,
                    new_path as u32,
                    new_len as u32,
                )
            })
        },
    )?;
    linker.func_wrap(
        m,
        "path_symlink",
        |_: Caller<'_, T>, _: i32, _: i32, _: i32, _: i32, _: i32| unsupported(),
    )?;
    linker.func_wrap(
        m,
        "path_unlink_file",
        |mut caller: Caller<'_, T>, fd: i32, path: i32, len: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.path_unlink_file(mem, fd as u32, path as u32, len as u32)
            })
        },
    )?;

    linker.func_wrap(
        m,
        "poll_oneoff",
        |mut caller: Caller<'_, T>, subs: i32, out: i32, nsubs: i32, nevents: i32| {
            syscall(&mut caller, |ctx, mem| {
                ctx.poll_oneoff(mem, subs as u32, out as u32, nsubs as u32, nevents as u32)
            })
        },
    )?;
    linker.func_wrap(m, "proc_exit", |_: Caller<'_, T>, code: i32| -> anyhow::Result<()> {
        Err(I32Exit(code).into())
    })?;
    linker.func_wrap(m, "proc_raise", |_: Caller<'_, T>, _sig: i32| {
        unsupported()
    })?;
    linker.func_wrap(m, "sched_yield", |_: Caller<'_, T>| {
        std::thread::yield_now();
        ret(Ok(()))
    })?;
    linker.func_wrap(m, "random_get", |mut caller: Caller<'_, T>, buf: i32, len: i32| {
        syscall(&mut caller, |ctx, mem| ctx.random_get(mem, buf as u32, len as u32))
    })?;

    linker.func_wrap(m, "sock_accept", |_: Caller<'_, T>, _: i32, _: i32, _: i32| {
        unsupported()
    })?;
    linker.func_wrap(
        m,
        "sock_recv",
        |_: Caller<'_, T>, _: i32, _: i32, _: i32, _: i32, _: i32, _: i32| {
            unsupported()
        },
    )?;
    linker.func_wrap(
        m,
        "sock_send",
        |_: Caller<'_, T>, _: i32, _: i32, _: i32, _: i32, _: i32| unsupported(),
    )?;
    linker.func_wrap(m, "sock_shutdown", |_: Caller<'_, T>, _: i32, _: i32| {
        unsupported()
    })?;

    Ok(())
}
