//! Command-line driver for the Vader compiler.
//!
//! Resolves modules from the filesystem, runs the core pipeline, writes the
//! emitted wasm module, prints diagnostics, and can execute the result in
//! an interpreter with the WASI-style host imports wired up.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Parser;
use vader_core::loader::{LoadError, LoadedModule, ModuleLoader};
use vader_core::{CompileOptions, Context, compile_wasm};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long)]
    input: String,

    #[arg(short, long)]
    output: String,

    #[arg(
        long,
        value_name = "PATH",
        help = "Search root for @load/@file modules (defaults to the input's directory)"
    )]
    root: Option<String>,

    #[arg(long, help = "Embed debug locations in the emitted module")]
    debug: bool,

    #[arg(long, help = "Run the emitted module after writing it")]
    run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    execute(cli)
}

fn execute(cli: Cli) -> Result<()> {
    let root = cli.root.as_ref().map(PathBuf::from);
    let mut loader = FsLoader::new(root);
    let mut ctx = Context::new();
    let options = CompileOptions { debug: cli.debug };

    let result = compile_wasm(&cli.input, &mut loader, &options, &mut ctx);
    report_diagnostics(&ctx);
    let artifact = result.map_err(|err| anyhow::anyhow!("{err}"))?;

    write_output(&cli.output, &artifact.wasm)?;

    if cli.run {
        let code = run_wasm(&artifact.wasm)?;
        println!("Program exited with {code}");
    }
    Ok(())
}

fn report_diagnostics(ctx: &Context) {
    for diagnostic in ctx.diagnostics.iter() {
        eprintln!(
            "{}: {} at {}",
            diagnostic.severity.as_str(),
            diagnostic.message,
            ctx.files.display(diagnostic.span),
        );
    }
}

fn write_output(path: &str, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = PathBuf::from(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {parent:?}"))?;
        }
    }
    fs::write(path, bytes).with_context(|| format!("failed to write output file {path}"))?;
    Ok(())
}

/// Filesystem module loader: identifiers resolve relative to the importing
/// file, then against the search root, trying the name verbatim and with
/// the `.vader` extension. The dedup key is the canonicalized path.
struct FsLoader {
    root: Option<PathBuf>,
    root_index: Vec<PathBuf>,
}

impl FsLoader {
    fn new(root: Option<PathBuf>) -> FsLoader {
        let root_index = root.as_deref().map(index_sources).unwrap_or_default();
        FsLoader { root, root_index }
    }

    fn candidates(&self, identifier: &str, from: Option<&str>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        let with_ext = format!("{identifier}.vader");
        match from {
            Some(from) => {
                let dir = Path::new(from).parent().unwrap_or_else(|| Path::new("."));
                candidates.push(dir.join(identifier));
                candidates.push(dir.join(&with_ext));
            }
            None => {
                candidates.push(PathBuf::from(identifier));
                candidates.push(PathBuf::from(&with_ext));
            }
        }
        if let Some(root) = &self.root {
            candidates.push(root.join(identifier));
            candidates.push(root.join(&with_ext));
        }
        // nested hits under the indexed root, e.g. @load "io" -> std/io.vader
        for indexed in &self.root_index {
            if indexed.ends_with(&with_ext) || indexed.ends_with(identifier) {
                candidates.push(indexed.clone());
            }
        }
        candidates
    }
}

fn index_sources(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.path().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "vader")
        })
        .map(|entry| entry.path().to_path_buf())
        .collect()
}

impl ModuleLoader for FsLoader {
    fn resolve(&mut self, identifier: &str, from: Option<&str>) -> Result<LoadedModule, LoadError> {
        for candidate in self.candidates(identifier, from) {
            if !candidate.is_file() {
                continue;
            }
            let content = fs::read_to_string(&candidate).map_err(|source| LoadError::Io {
                identifier: identifier.to_string(),
                source,
            })?;
            let key = candidate
                .canonicalize()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| candidate.display().to_string());
            return Ok(LoadedModule {
                key,
                name: candidate.display().to_string(),
                content,
            });
        }
        Err(LoadError::NotFound(identifier.to_string()))
    }
}

#[derive(Default)]
struct Host {
    exit: Option<i32>,
}

fn run_wasm(wasm: &[u8]) -> Result<i32> {
    let engine = wasmi::Engine::default();
    let module =
        wasmi::Module::new(&engine, wasm).context("failed to load the emitted module")?;
    let mut linker: wasmi::Linker<Host> = wasmi::Linker::new(&engine);
    linker
        .func_wrap(
            "wasi_snapshot_preview1",
            "proc_exit",
            |mut caller: wasmi::Caller<'_, Host>, code: i32| {
                caller.data_mut().exit = Some(code);
            },
        )
        .context("failed to link proc_exit")?;
    linker
        .func_wrap(
            "wasi_snapshot_preview1",
            "fd_write",
            |mut caller: wasmi::Caller<'_, Host>,
             _fd: i32,
             iovec_ptr: i32,
             _iovec_len: i32,
             nwritten_ptr: i32|
             -> i32 {
                let Some(memory) = caller
                    .get_export("memory")
                    .and_then(wasmi::Extern::into_memory)
                else {
                    return 8; // WASI EBADF
                };
                let mut header = [0u8; 8];
                if memory.read(&caller, iovec_ptr as usize, &mut header).is_err() {
                    return 21; // WASI EFAULT
                }
                let ptr = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
                let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
                let mut bytes = vec![0u8; len];
                if memory.read(&caller, ptr, &mut bytes).is_err() {
                    return 21;
                }
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(&bytes);
                let _ = stdout.flush();
                let written = (len as u32).to_le_bytes();
                let _ = memory.write(&mut caller, nwritten_ptr as usize, &written);
                0
            },
        )
        .context("failed to link fd_write")?;
    let mut store = wasmi::Store::new(&engine, Host::default());
    linker
        .instantiate_and_start(&mut store, &module)
        .context("failed to instantiate and start the module")?;
    Ok(store.into_data().exit.unwrap_or(0))
}
