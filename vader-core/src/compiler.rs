//! Pipeline orchestration: source → tokens → AST → HIR → wasm module.
//!
//! The driver owns a [`Context`] per compilation unit (diagnostics sink and
//! file registry), injects a [`ModuleLoader`], and calls [`compile_wasm`].
//! Stages run strictly sequentially; failures unwind as
//! [`CoreError`] while recoverable problems accumulate in the context. Code
//! generation only runs when resolution produced no error diagnostics.

use crate::ast;
use crate::codegen_wasm::CodeGenerator;
use crate::diagnostic::Diagnostics;
use crate::error::CoreError;
use crate::hir;
use crate::loader::ModuleLoader;
use crate::parser;
use crate::resolve;
use crate::span::SourceMap;

/// Per-compilation-unit state shared by every stage.
#[derive(Debug, Default)]
pub struct Context {
    pub diagnostics: Diagnostics,
    pub files: SourceMap,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }
}

/// Knobs the driver can set.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Embed per-instruction debug locations into the emitted module.
    pub debug: bool,
}

/// The result of a successful compilation.
#[derive(Debug, PartialEq, Eq)]
pub struct CompilationArtifact {
    pub wasm: Vec<u8>,
}

/// Parse the entry module and everything it `@load`s.
pub fn parse_program(
    entry: &str,
    loader: &mut dyn ModuleLoader,
    ctx: &mut Context,
) -> Result<ast::Program, CoreError> {
    parser::parse_program(entry, loader, &mut ctx.files, &mut ctx.diagnostics)
}

/// Resolve a parsed program into typed HIR. Check
/// `ctx.diagnostics.has_errors()` before generating code.
pub fn resolve(program: &ast::Program, ctx: &mut Context) -> hir::Program {
    resolve::resolve(program, &ctx.files, &mut ctx.diagnostics)
}

/// Run the whole pipeline.
pub fn compile_wasm(
    entry: &str,
    loader: &mut dyn ModuleLoader,
    options: &CompileOptions,
    ctx: &mut Context,
) -> Result<CompilationArtifact, CoreError> {
    let program = parse_program(entry, loader, ctx)?;
    let resolved = resolve(&program, ctx);
    if ctx.diagnostics.has_errors() {
        return Err(CoreError::ResolutionFailed {
            count: ctx.diagnostics.error_count(),
        });
    }
    let generator = CodeGenerator::new(&ctx.files, options.debug);
    let wasm = generator.emit(&resolved)?;
    Ok(CompilationArtifact { wasm })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;

    fn compile(source: &str) -> Result<CompilationArtifact, (CoreError, Context)> {
        compile_with_options(source, &CompileOptions::default())
    }

    fn compile_with_options(
        source: &str,
        options: &CompileOptions,
    ) -> Result<CompilationArtifact, (CoreError, Context)> {
        let mut loader = MemoryLoader::new();
        loader.insert("main", source);
        let mut ctx = Context::new();
        compile_wasm("main", &mut loader, options, &mut ctx).map_err(|err| (err, ctx))
    }

    fn compile_ok(source: &str) -> Vec<u8> {
        match compile(source) {
            Ok(artifact) => artifact.wasm,
            Err((err, ctx)) => {
                let messages: Vec<_> =
                    ctx.diagnostics.iter().map(|d| d.message.clone()).collect();
                panic!("compilation failed: {err}; diagnostics: {messages:?}");
            }
        }
    }

    /// Validate a module that uses GC heap types.
    fn validate(wasm: &[u8]) {
        use wasmparser::{Validator, WasmFeatures};
        let features = WasmFeatures::default()
            | WasmFeatures::GC
            | WasmFeatures::FUNCTION_REFERENCES
            | WasmFeatures::REFERENCE_TYPES;
        Validator::new_with_features(features)
            .validate_all(wasm)
            .expect("emitted module should validate");
    }

    #[derive(Default)]
    struct Host {
        exit: Option<i32>,
        out: Vec<u8>,
    }

    /// Instantiate with wasmi, wiring the WASI-style imports: `proc_exit`
    /// records the code, `fd_write` captures bytes from linear memory.
    fn run(wasm: &[u8]) -> Host {
        let engine = wasmi::Engine::default();
        let module = wasmi::Module::new(&engine, wasm).expect("module");
        let mut linker: wasmi::Linker<Host> = wasmi::Linker::new(&engine);
        linker
            .func_wrap(
                "wasi_snapshot_preview1",
                "proc_exit",
                |mut caller: wasmi::Caller<'_, Host>, code: i32| {
                    caller.data_mut().exit = Some(code);
                },
            )
            .expect("link proc_exit");
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
                    let memory = caller
                        .get_export("memory")
                        .and_then(wasmi::Extern::into_memory)
                        .expect("exported memory");
                    let mut header = [0u8; 8];
                    memory
                        .read(&caller, iovec_ptr as usize, &mut header)
                        .expect("read iovec");
                    let ptr = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
                    let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
                    let mut bytes = vec![0u8; len];
                    memory.read(&caller, ptr, &mut bytes).expect("read bytes");
                    caller.data_mut().out.extend_from_slice(&bytes);
                    let written = (len as u32).to_le_bytes();
                    memory
                        .write(&mut caller, nwritten_ptr as usize, &written)
                        .expect("write nwritten");
                    0
                },
            )
            .expect("link fd_write");
        let mut store = wasmi::Store::new(&engine, Host::default());
        linker
            .instantiate_and_start(&mut store, &module)
            .expect("instantiate and start");
        store.into_data()
    }

    #[test]
    fn entry_result_is_forwarded_to_proc_exit() {
        let wasm = compile_ok("main := fn() -> u32 { return 42 }");
        let host = run(&wasm);
        assert_eq!(host.exit, Some(42));
    }

    #[test]
    fn arithmetic_and_loops_execute() {
        let wasm = compile_ok(
            "main := fn() -> u32 {\n\
               total := 0\n\
               for (i := 0; i < 5; i++) { total = total + i }\n\
               return total\n\
             }",
        );
        let host = run(&wasm);
        assert_eq!(host.exit, Some(10));
    }

    #[test]
    fn calls_and_conditionals_execute() {
        let wasm = compile_ok(
            "pick :: fn(n: u32) -> u32 {\n\
               x := if n < 10 { n + 1 } elif n < 100 { n + 2 } else { n + 3 }\n\
               return x\n\
             }\n\
             main := fn() -> u32 { return pick(50) }",
        );
        let host = run(&wasm);
        assert_eq!(host.exit, Some(52));
    }

    #[test]
    fn print_writes_literal_bytes_through_fd_write() {
        let wasm = compile_ok(
            "main := fn() -> u32 { print(\"hello\\n\") return 0 }",
        );
        let host = run(&wasm);
        assert_eq!(host.out, b"hello\n");
        assert_eq!(host.exit, Some(0));
    }

    #[test]
    fn load_splices_cross_file_symbols() {
        let mut loader = MemoryLoader::new();
        loader.insert(
            "main",
            "@load \"other\"\nmain := fn() -> u32 { return helper() }",
        );
        loader.insert("other", "helper :: fn() -> u32 { return 7 }");
        let mut ctx = Context::new();
        let artifact =
            compile_wasm("main", &mut loader, &CompileOptions::default(), &mut ctx)
                .expect("compile");
        let host = run(&artifact.wasm);
        assert_eq!(host.exit, Some(7));
    }

    #[test]
    fn globals_initialize_before_main() {
        let wasm = compile_ok(
            "base := 40\n\
             bump :: fn(n: u32) -> u32 { return n + 2 }\n\
             offset := bump(0)\n\
             main := fn() -> u32 { return base + offset }",
        );
        let host = run(&wasm);
        assert_eq!(host.exit, Some(42));
    }

    #[test]
    fn struct_field_mutation_emits_gc_module() {
        let wasm = compile_ok(
            "Point :: struct { x: u32 y: u32 }\n\
             main := fn() -> u32 {\n\
               p := Point{x: 1, y: 2}\n\
               p.x = 99\n\
               return p.x\n\
             }",
        );
        validate(&wasm);
    }

    #[test]
    fn array_length_intrinsic_emits_gc_module() {
        let wasm = compile_ok(
            "main := fn() -> u32 {\n\
               arr := [3]u32{1, 2, 3}\n\
               return length(arr)\n\
             }",
        );
        validate(&wasm);
    }

    #[test]
    fn default_initialized_arrays_of_structs_validate() {
        let wasm = compile_ok(
            "Cell :: struct { tag: u8 value: u32 }\n\
             main := fn() -> u32 {\n\
               grid := [4]Cell\n\
               grid[2].value = 7\n\
               return grid[2].value\n\
             }",
        );
        validate(&wasm);
    }

    #[test]
    fn undeclared_struct_yields_one_error_and_no_module() {
        let (err, ctx) = compile("main := fn() -> u32 { f := Foo{} return 0 }")
            .expect_err("compilation must fail");
        assert!(matches!(err, CoreError::ResolutionFailed { count: 1 }));
        assert_eq!(ctx.diagnostics.error_count(), 1);
    }

    #[test]
    fn void_entry_starts_directly() {
        let wasm = compile_ok("main := fn() -> void { print(\"ok\") }");
        let host = run(&wasm);
        assert_eq!(host.out, b"ok");
        assert_eq!(host.exit, None, "void main never reaches proc_exit");
    }

    #[test]
    fn entry_with_wrong_return_type_is_fatal() {
        let (err, _) = compile("main := fn() -> boolean { return true }")
            .expect_err("compilation must fail");
        assert!(matches!(err, CoreError::BadEntry { .. }));
    }

    #[test]
    fn missing_entry_is_fatal() {
        let (err, _) =
            compile("helper :: fn() -> u32 { return 1 }").expect_err("compilation must fail");
        assert!(matches!(err, CoreError::MissingEntry(_)));
    }

    #[test]
    fn debug_build_embeds_location_section() {
        let options = CompileOptions { debug: true };
        let wasm = compile_with_options("main := fn() -> u32 { return 42 }", &options)
            .map(|a| a.wasm)
            .expect("compile");
        assert!(
            wasm.windows(b"vader.debug".len()).any(|w| w == b"vader.debug"),
            "debug section should be present"
        );
        let plain = compile_ok("main := fn() -> u32 { return 42 }");
        assert!(
            !plain.windows(b"vader.debug".len()).any(|w| w == b"vader.debug"),
            "release builds carry no debug section"
        );
    }

    #[test]
    fn unrecognized_intrinsic_name_is_fatal_at_generation() {
        let (err, ctx) = compile(
            "@intrinsic frob :: fn() -> void\n\
             main := fn() -> void { frob() }",
        )
        .expect_err("compilation must fail");
        assert!(!ctx.diagnostics.has_errors(), "resolution accepts the call");
        assert!(matches!(err, CoreError::UnknownIntrinsic(name) if name == "frob"));
    }

    #[test]
    fn exit_intrinsic_terminates_with_code() {
        let wasm = compile_ok("main := fn() -> void { exit(3) }");
        let host = run(&wasm);
        assert_eq!(host.exit, Some(3));
    }
}
