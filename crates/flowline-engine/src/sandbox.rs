//! Sandboxed piece execution.
//!
//! The interpreter never holds piece code. It hands a [`SandboxOperation`]
//! to a [`Sandbox`] and gets back a [`SandboxResponse`] whose status
//! classifies worker health.
//!
//! [`WasmSandbox`] runs piece modules compiled to `wasm32-wasip1` in Wasmtime:
//!
//! 1. The module is located through the [`PieceCatalog`] and cached per piece version
//! 2. The serialized operation is written to the guest's WASI stdin
//! 3. The guest runs under a fuel budget, a wall-clock timeout and a memory ceiling
//! 4. Guest stdout is parsed as the JSON `result`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Linker, Module, ResourceLimiter, Store, Trap};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};

use crate::catalog::PieceCatalog;
use crate::error::{EngineError, Result};
use crate::protocol::{EngineResponseStatus, PieceRef, SandboxOperation, SandboxResponse};

/// Executes sandbox operations in an isolated worker.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run one operation.
    ///
    /// Guest faults come back as non-OK responses; `Err` is reserved for
    /// engine-side problems such as a piece missing from the catalog.
    async fn execute(&self, operation: SandboxOperation) -> Result<SandboxResponse>;
}

/// Resource limits for one sandbox invocation.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock limit per invocation.
    pub step_timeout: Duration,
    /// Linear memory ceiling per guest.
    pub max_memory_bytes: usize,
    /// Fuel granted per second of `step_timeout` (roughly instructions/sec).
    pub fuel_per_sec: u64,
    /// Maximum captured stdout.
    pub stdout_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            max_memory_bytes: 128 * 1024 * 1024,
            fuel_per_sec: 33_000_000,
            stdout_limit: 1024 * 1024,
        }
    }
}

/// Store data: WASI context plus the memory guard.
struct GuestState {
    wasi: WasiP1Ctx,
    memory: MemoryGuard,
}

/// Denies memory growth past the ceiling and remembers that it did.
struct MemoryGuard {
    max_bytes: usize,
    exceeded: bool,
}

impl ResourceLimiter for MemoryGuard {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_bytes {
            self.exceeded = true;
            return Ok(false);
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        _desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(true)
    }
}

/// Raw result of one guest run.
#[derive(Debug)]
struct GuestOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
    elapsed: Duration,
}

/// Wasmtime-backed [`Sandbox`].
pub struct WasmSandbox {
    /// Wasmtime engine (shared across all executions).
    engine: Engine,
    catalog: PieceCatalog,
    config: SandboxConfig,
    /// `name@version` → compiled module.
    module_cache: Arc<RwLock<HashMap<String, Module>>>,
}

impl WasmSandbox {
    pub fn new(catalog: PieceCatalog, config: SandboxConfig) -> Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(true);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| EngineError::Sandbox(format!("Failed to create Wasmtime engine: {e}")))?;

        Ok(Self {
            engine,
            catalog,
            config,
            module_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn catalog(&self) -> &PieceCatalog {
        &self.catalog
    }

    /// Clear the in-memory module cache.
    pub async fn clear_cache(&self) {
        self.module_cache.write().await.clear();
    }

    async fn load_module(&self, piece: &PieceRef) -> Result<Module> {
        let key = piece.to_string();
        if let Some(module) = self.module_cache.read().await.get(&key).cloned() {
            debug!(piece = %key, "WASM cache hit");
            return Ok(module);
        }

        let bytes = self.catalog.read_module(piece)?;
        let start = Instant::now();
        let module = Module::new(&self.engine, &bytes).map_err(|e| {
            EngineError::Sandbox(format!("Failed to load piece '{piece}': {e}"))
        })?;
        debug!(piece = %key, elapsed = ?start.elapsed(), "Compiled piece module");

        self.module_cache.write().await.insert(key, module.clone());
        Ok(module)
    }

    /// Synchronous WASM execution with Wasmtime + WASI Preview 1.
    fn execute_sync(
        engine: &Engine,
        module: &Module,
        input_json: &str,
        config: &SandboxConfig,
    ) -> std::result::Result<GuestOutput, SandboxResponse> {
        let start = Instant::now();

        let stdin_pipe = MemoryInputPipe::new(input_json.as_bytes().to_vec());
        let stdout_pipe = MemoryOutputPipe::new(config.stdout_limit);
        let stderr_pipe = MemoryOutputPipe::new(256 * 1024);

        let mut wasi_builder = WasiCtxBuilder::new();
        wasi_builder
            .stdin(stdin_pipe)
            .stdout(stdout_pipe.clone())
            .stderr(stderr_pipe.clone());

        let state = GuestState {
            wasi: wasi_builder.build_p1(),
            memory: MemoryGuard {
                max_bytes: config.max_memory_bytes,
                exceeded: false,
            },
        };
        let mut store = Store::new(engine, state);
        store.limiter(|s| &mut s.memory);

        let fuel = config
            .fuel_per_sec
            .saturating_mul(config.step_timeout.as_secs().max(1));
        store
            .set_fuel(fuel)
            .map_err(|e| internal(format!("Failed to set fuel: {e}")))?;

        let mut linker = Linker::new(engine);
        wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |s: &mut GuestState| &mut s.wasi)
            .map_err(|e| internal(format!("Failed to link WASI: {e}")))?;

        let instance = match linker.instantiate(&mut store, module) {
            Ok(instance) => instance,
            Err(e) => return Err(classify_trap(&e, store.data().memory.exceeded)),
        };

        let start_fn = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| internal(format!("No _start entry point: {e}")))?;

        let exit_code = match start_fn.call(&mut store, ()) {
            Ok(()) => 0,
            Err(e) => match e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                Some(exit) => exit.0,
                None => return Err(classify_trap(&e, store.data().memory.exceeded)),
            },
        };

        let stdout = String::from_utf8(stdout_pipe.contents().to_vec())
            .unwrap_or_else(|_| String::from("<non-utf8 output>"));
        let stderr = String::from_utf8(stderr_pipe.contents().to_vec())
            .unwrap_or_else(|_| String::from("<non-utf8 stderr>"));

        Ok(GuestOutput {
            stdout,
            stderr,
            exit_code,
            elapsed: start.elapsed(),
        })
    }
}

fn internal(message: String) -> SandboxResponse {
    SandboxResponse::fault(EngineResponseStatus::InternalError, message)
}

/// Map a Wasmtime error to a sandbox fault.
fn classify_trap(err: &wasmtime::Error, memory_exceeded: bool) -> SandboxResponse {
    if matches!(err.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
        return SandboxResponse::fault(
            EngineResponseStatus::Timeout,
            "Piece execution timed out (fuel exhausted)",
        );
    }
    if memory_exceeded {
        return SandboxResponse::fault(
            EngineResponseStatus::MemoryIssue,
            format!("Piece exceeded its memory limit: {err}"),
        );
    }
    internal(format!("WASM execution error: {err}"))
}

#[async_trait]
impl Sandbox for WasmSandbox {
    async fn execute(&self, operation: SandboxOperation) -> Result<SandboxResponse> {
        let piece = operation.piece().ok_or_else(|| {
            EngineError::Sandbox(format!(
                "{:?} operation carries no piece reference",
                operation.operation_type
            ))
        })?;
        let module = self.load_module(&piece).await?;
        let input_json = serde_json::to_string(&operation)?;

        let engine = self.engine.clone();
        let config = self.config.clone();
        let timeout = self.config.step_timeout;

        let task = tokio::task::spawn_blocking(move || {
            Self::execute_sync(&engine, &module, &input_json, &config)
        });

        let output = match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                warn!(piece = %piece, timeout = ?timeout, "Piece exceeded wall-clock timeout");
                return Ok(SandboxResponse::fault(
                    EngineResponseStatus::Timeout,
                    format!("Piece '{piece}' exceeded {}s", timeout.as_secs_f64()),
                ));
            }
            Ok(joined) => joined
                .map_err(|e| EngineError::Sandbox(format!("Task join error: {e}")))?,
        };

        let output = match output {
            Ok(output) => output,
            Err(fault) => {
                warn!(piece = %piece, status = %fault.status, message = ?fault.message, "Sandbox fault");
                return Ok(fault);
            }
        };

        debug!(piece = %piece, elapsed = ?output.elapsed, exit_code = output.exit_code, "Piece finished");

        if output.exit_code != 0 {
            warn!(piece = %piece, exit_code = output.exit_code, "Piece exited with non-zero code");
            return Ok(internal(format!(
                "Piece '{piece}' exited with code {}. stderr: {}",
                output.exit_code, output.stderr
            )));
        }

        match serde_json::from_str::<Value>(&output.stdout) {
            Ok(result) => Ok(SandboxResponse::ok(result)),
            Err(e) => Ok(internal(format!(
                "Piece '{piece}' produced invalid output JSON: {e}. stdout: {}",
                output.stdout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::protocol::{EngineOperationType, ExtractMetadataPayload};
    use tempfile::TempDir;

    /// Writes `{"status":"ok","output":{"echo":true}}` to stdout.
    const OK_WAT: &str = r##"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{\"status\":\"ok\",\"output\":{\"echo\":true}}")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 38))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"##;

    const SPIN_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start")
    (loop $spin (br $spin))))
"#;

    const GREEDY_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start")
    (if (i32.eq (memory.grow (i32.const 1000)) (i32.const -1))
      (then unreachable))))
"#;

    const EXIT_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (call $proc_exit (i32.const 3))))
"#;

    const SILENT_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start")))
"#;

    fn sandbox_with(modules: &[(&str, &str)], config: SandboxConfig) -> (WasmSandbox, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut catalog = PieceCatalog::load(tmp.path()).unwrap();
        for (name, wat) in modules {
            let relative = format!("modules/{name}.wasm");
            std::fs::write(tmp.path().join(&relative), wat).unwrap();
            catalog
                .add(
                    &PieceRef::new(*name, "1.0.0"),
                    CatalogEntry {
                        description: String::new(),
                        path: relative,
                        sha256: None,
                    },
                )
                .unwrap();
        }
        (WasmSandbox::new(catalog, config).unwrap(), tmp)
    }

    fn op(piece: &str) -> SandboxOperation {
        SandboxOperation::new(
            EngineOperationType::ExtractPieceMetadata,
            &ExtractMetadataPayload {
                piece: PieceRef::new(piece, "1.0.0"),
            },
        )
        .unwrap()
    }

    fn small_config() -> SandboxConfig {
        SandboxConfig {
            step_timeout: Duration::from_secs(5),
            max_memory_bytes: 1024 * 1024,
            fuel_per_sec: 100_000,
            stdout_limit: 64 * 1024,
        }
    }

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.step_timeout, Duration::from_secs(30));
        assert_eq!(config.max_memory_bytes, 128 * 1024 * 1024);
        assert_eq!(config.fuel_per_sec, 33_000_000);
    }

    #[tokio::test]
    async fn test_ok_result_parsed() {
        let (sandbox, _tmp) = sandbox_with(&[("ok", OK_WAT)], small_config());
        let response = sandbox.execute(op("ok")).await.unwrap();
        assert!(response.is_ok(), "unexpected fault: {:?}", response.message);
        assert_eq!(response.result.unwrap()["output"]["echo"], true);
    }

    #[tokio::test]
    async fn test_module_cached_per_version() {
        let (sandbox, _tmp) = sandbox_with(&[("ok", OK_WAT)], small_config());
        sandbox.execute(op("ok")).await.unwrap();
        assert!(sandbox.module_cache.read().await.contains_key("ok@1.0.0"));
        sandbox.clear_cache().await;
        assert!(sandbox.module_cache.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_fuel_exhaustion_is_timeout() {
        let (sandbox, _tmp) = sandbox_with(&[("spin", SPIN_WAT)], small_config());
        let response = sandbox.execute(op("spin")).await.unwrap();
        assert_eq!(response.status, EngineResponseStatus::Timeout);
    }

    #[tokio::test]
    async fn test_memory_ceiling_is_memory_issue() {
        let (sandbox, _tmp) = sandbox_with(&[("greedy", GREEDY_WAT)], small_config());
        let response = sandbox.execute(op("greedy")).await.unwrap();
        assert_eq!(response.status, EngineResponseStatus::MemoryIssue);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_internal_error() {
        let (sandbox, _tmp) = sandbox_with(&[("exit", EXIT_WAT)], small_config());
        let response = sandbox.execute(op("exit")).await.unwrap();
        assert_eq!(response.status, EngineResponseStatus::InternalError);
        assert!(response.message.unwrap().contains("exited with code 3"));
    }

    #[tokio::test]
    async fn test_invalid_output_is_internal_error() {
        let (sandbox, _tmp) = sandbox_with(&[("silent", SILENT_WAT)], small_config());
        let response = sandbox.execute(op("silent")).await.unwrap();
        assert_eq!(response.status, EngineResponseStatus::InternalError);
        assert!(response.message.unwrap().contains("invalid output JSON"));
    }

    #[tokio::test]
    async fn test_unknown_piece_is_engine_error() {
        let (sandbox, _tmp) = sandbox_with(&[], small_config());
        match sandbox.execute(op("ghost")).await {
            Err(EngineError::Catalog(msg)) => assert!(msg.contains("not installed")),
            other => panic!("Expected Catalog error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operation_without_piece() {
        let (sandbox, _tmp) = sandbox_with(&[], small_config());
        let operation = SandboxOperation {
            operation_type: EngineOperationType::ExecuteFlow,
            payload: serde_json::json!({}),
        };
        assert!(matches!(
            sandbox.execute(operation).await,
            Err(EngineError::Sandbox(_))
        ));
    }
}
