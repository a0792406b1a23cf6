use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use wasi_bridge::wasi::StdioMode;
use wasi_bridge::{BridgeConfig, Loader, ModuleSource, Session, VfsSnapshot};
use wasmtime::{Val, ValType};

/// Load a WASI module through the bridge and run it or call one of its bindings.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path or http(s) URL of the module
    module: ModuleSource,

    /// JSON file with the bridge configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON file seeding the in-memory filesystem
    #[arg(long)]
    fs: Option<PathBuf>,

    /// Number of async workers
    #[arg(long)]
    pool_size: Option<usize>,

    /// Binding to call, `Class.method` or `function`. Runs `_start` when absent.
    #[arg(long)]
    call: Option<String>,

    /// Print the registered classes and functions and exit
    #[arg(long)]
    list: bool,

    /// Print the filesystem as JSON once the module returned
    #[arg(long)]
    dump_fs: bool,

    /// Numeric arguments for the called binding
    #[arg(allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Args::parse()) {
        Ok(code) => exit_code(code),
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Codes that do not fit a process exit status fail instead of wrapping.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(exit_status(code))
}

fn load_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            BridgeConfig::from_json(&json)?
        }
        None => BridgeConfig::default(),
    };
    if let Some(path) = &args.fs {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let seed: VfsSnapshot = serde_json::from_str(&json)
            .with_context(|| format!("invalid filesystem seed in {}", path.display()))?;
        config = config.with_fs(seed);
    }
    if let Some(size) = args.pool_size {
        config = config.with_pool_size(size);
    }
    // a --config file decides its own stdio
    if args.config.is_none() {
        config.wasi.stdio = StdioMode::Inherit;
    }
    Ok(config)
}

fn parse_args(params: &[ValType], args: &[String]) -> anyhow::Result<Vec<Val>> {
    if params.len() != args.len() {
        bail!("expected {} arguments, got {}", params.len(), args.len());
    }
    params
        .iter()
        .zip(args)
        .map(|(ty, arg)| {
            let val = match ty {
                ValType::I32 => Val::I32(arg.parse()?),
                ValType::I64 => Val::I64(arg.parse()?),
                ValType::F32 => Val::F32(arg.parse::<f32>()?.to_bits()),
                ValType::F64 => Val::F64(arg.parse::<f64>()?.to_bits()),
                ty => bail!("cannot pass an argument of type {ty}"),
            };
            Ok(val)
        })
        .collect()
}

fn list(session: &Session) {
    let ns = session.namespace();
    for class in ns.classes() {
        println!("class {}", class.name());
        if let Some(ctor) = class.constructor() {
            println!("  constructor -> {}", ctor.export());
        }
        for method in class.methods() {
            println!(
                "  {} {:?} {:?} -> {}",
                method.name(),
                method.kind(),
                method.mode(),
                method.export()
            );
        }
    }
    for function in ns.functions() {
        println!("function {} {:?} -> {}", function.name(), function.mode(), function.export());
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let loader = Loader::new(load_config(&args)?)?;
    let session = loader.load(args.module.clone())?;
    log::info!("loaded {} as session {}", args.module, session.session_id());

    if args.list {
        list(&session);
        return Ok(0);
    }

    let code = match &args.call {
        None => session.run_start()?,
        Some(path) => {
            let binding = session.namespace().lookup(path)?;
            let func = session
                .module()
                .get_export(binding.export())
                .and_then(|export| export.func().cloned())
                .with_context(|| format!("{} is not an exported function", binding.export()))?;
            let params: Vec<_> = func.params().collect();
            let vals = parse_args(&params, &args.args)?;
            for result in session.call(binding, &vals)? {
                match result {
                    Val::I32(v) => println!("{v}"),
                    Val::I64(v) => println!("{v}"),
                    Val::F32(bits) => println!("{}", f32::from_bits(bits)),
                    Val::F64(bits) => println!("{}", f64::from_bits(bits)),
                    other => println!("{other:?}"),
                }
            }
            0
        }
    };

    if args.dump_fs {
        let snapshot = session.with_vfs(|vfs| vfs.to_snapshot());
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    session.shutdown();
    Ok(code)
}
