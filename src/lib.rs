//! Multi-tenant job execution engine: compiles and runs untrusted source
//! under hard CPU, memory, wall-clock, and output caps, using a pool of
//! dedicated low-privilege UID/GID sandbox slots.
//!
//! The engine is transport-agnostic: [`job::Job`] exposes a batch mode
//! (`execute`) and a streaming mode (`execute_interactive`) driven by an
//! [`bus::EventBus`]; an HTTP or WebSocket adapter built on top maps
//! [`protocol`] shapes onto those two entry points. See `warden-cli` for a
//! minimal standalone adapter.

pub mod bus;
pub mod config;
pub mod error;
pub mod governor;
pub mod isolation;
pub mod job;
pub mod protocol;
pub mod registry;
pub mod signal;
pub mod supervisor;

pub use config::EngineConfig;
pub use error::EngineError;
pub use governor::ConcurrencyGovernor;
pub use isolation::IsolationProvider;
pub use job::{ExecutionResult, Job, JobRequest};
pub use registry::Registry;

use std::sync::Arc;

/// Shared, immutable handle bundling the collaborators a request-facing
/// adapter needs: the runtime catalog, the sandbox pool, and the
/// concurrency governor. Cheap to clone; intended to be built once at
/// startup and handed to every connection/request handler.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    isolation: Arc<IsolationProvider>,
    governor: ConcurrencyGovernor,
    memory_ceiling_bytes: u64,
    default_max_output_bytes: usize,
}

impl Engine {
    pub fn new(config: &EngineConfig, registry: Registry) -> Result<Engine, EngineError> {
        let isolation = IsolationProvider::new(config)?;
        Ok(Engine {
            registry: Arc::new(registry),
            isolation: Arc::new(isolation),
            governor: ConcurrencyGovernor::new(
                config.per_client_concurrency_cap,
                config.global_concurrency_cap,
            ),
            memory_ceiling_bytes: config.memory_ceiling_bytes,
            default_max_output_bytes: config.default_max_output_bytes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Reserves a concurrency-governor token for `client_key`. Hold the
    /// returned [`governor::Token`] for the lifetime of the job; dropping it
    /// releases both the per-client and the global reservation.
    pub fn admit(&self, client_key: &str) -> Result<governor::Token, EngineError> {
        self.governor
            .try_enter(client_key)
            .map_err(|_| EngineError::ResourceExhausted(format!("concurrency cap reached for {client_key}")))
    }

    /// Resolves a request into a primed [`Job`], ready for `execute` or
    /// `execute_interactive`. Validates the requested language/version and
    /// stages every file; on any failure the sandbox slot (if acquired) is
    /// released before the error is returned.
    pub fn prepare(
        &self,
        language: &str,
        version: &str,
        request: JobRequest,
    ) -> Result<Job, EngineError> {
        let runtime = self.registry.lookup(language, version)?.clone();
        let mut job = Job::new(
            Arc::new(runtime),
            request,
            self.isolation.clone(),
            self.memory_ceiling_bytes,
        );
        job.prime()?;
        Ok(job)
    }

    pub fn default_max_output_bytes(&self) -> usize {
        self.default_max_output_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RuntimeDescriptor, Version};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn running_as_root() -> bool {
        nix::unistd::Uid::effective().is_root()
    }

    fn test_engine(isolate_root: &std::path::Path) -> Engine {
        let config = EngineConfig {
            slot_count: 2,
            isolate_root: isolate_root.to_path_buf(),
            ..EngineConfig::default()
        };
        let registry = Registry::new(vec![RuntimeDescriptor {
            language: "python".to_string(),
            version: Version::parse("3.10.0").unwrap(),
            aliases: vec![],
            install_prefix: PathBuf::from("/opt/python"),
            compile_script: None,
            run_script: PathBuf::from("/bin/cat"),
            base_env: HashMap::new(),
            runtime: "cpython".to_string(),
        }])
        .unwrap();
        Engine::new(&config, registry).unwrap()
    }

    #[test]
    fn prepare_fails_for_unknown_language() {
        if !running_as_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let request = job::JobRequest {
            alias: "ruby".to_string(),
            args: vec![],
            files: vec![job::FileEntry {
                path: PathBuf::from("main.rb"),
                content: b"puts 1".to_vec(),
                executable: false,
            }],
            compile_ms: 1000,
            run_ms: 1000,
            compile_bytes: None,
            run_bytes: None,
            max_output_bytes: 4096,
            stdin: Vec::new(),
        };
        assert!(engine.prepare("ruby", "3.10", request).is_err());
    }

    #[test]
    fn admit_rejects_past_per_client_cap() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        // default per-client cap is 4: four concurrent admits succeed, the
        // fifth is rejected while the first four tokens are still held.
        let tokens: Vec<_> = (0..4).map(|_| engine.admit("client-a")).collect();
        assert!(tokens.iter().all(|t| t.is_ok()));
        assert!(engine.admit("client-a").is_err());
    }
}
