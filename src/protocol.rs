//! Wire shapes for the two transport-agnostic request forms the core
//! supports: a one-shot batch request/response, and a bidirectional
//! interactive session. Both are `serde`-tagged so an adapter can decode a
//! request without knowing which variant it is in advance.
//!
//! This module only defines shapes and the fixed close-code table; an
//! adapter (HTTP handler, WebSocket loop, …) is responsible for actually
//! moving bytes and is out of scope here.

use serde::{Deserialize, Serialize};

use crate::supervisor::PhaseResult;

/// A single staged file in a request. `name` is the path relative to the
/// slot root; omitted names are assigned `fileN` by the adapter before this
/// struct is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub content: String,
    /// `true` if `content` is base64-encoded binary rather than UTF-8 text.
    #[serde(default)]
    pub encoded: bool,
}

/// Shared request fields for both transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub language: String,
    pub version: String,
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub run_timeout: Option<u64>,
    #[serde(default)]
    pub compile_timeout: Option<u64>,
    /// `None` means unlimited, subject to the engine's memory ceiling.
    #[serde(default)]
    pub run_memory_limit: Option<i64>,
    #[serde(default)]
    pub compile_memory_limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub language: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<PhaseResult>,
    /// Absent when a compile phase failed and run was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<PhaseResult>,
}

/// Client-to-server interactive messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Init(JobSpec),
    Data { stream: Stream, data: String },
    Signal { signal: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

/// Server-to-client interactive messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Runtime { language: String, version: String },
    Stage { stage: StageName },
    Data { stream: Stream, data: String },
    Exit {
        stage: StageName,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Compile,
    Run,
}

impl From<crate::bus::Stage> for StageName {
    fn from(stage: crate::bus::Stage) -> StageName {
        match stage {
            crate::bus::Stage::Compile => StageName::Compile,
            crate::bus::Stage::Run => StageName::Run,
        }
    }
}

/// Session close codes, range 4000-4999 per the interactive protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    AlreadyInitialized = 4000,
    InitTimeout = 4001,
    ErrorNotified = 4002,
    NotInitialized = 4003,
    WriteToNonStdinStream = 4004,
    InvalidSignal = 4005,
    JobCompleted = 4999,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// How long an interactive session waits for its first `init` message
/// before closing with [`CloseCode::InitTimeout`].
pub const INIT_TIMEOUT_MS: u64 = 1_000;

/// Resolves a [`JobSpec`]'s files into [`crate::job::FileEntry`] values,
/// decoding base64 where `encoded` is set and assigning `fileN` names to
/// entries that omitted one.
pub fn decode_files(files: &[FileSpec]) -> Result<Vec<crate::job::FileEntry>, String> {
    use base64::Engine;
    let mut out = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        let content = if file.encoded {
            base64::engine::general_purpose::STANDARD
                .decode(&file.content)
                .map_err(|e| format!("invalid base64 in file {index}: {e}"))?
        } else {
            file.content.clone().into_bytes()
        };
        let name = file
            .name
            .clone()
            .unwrap_or_else(|| format!("file{index}"));
        out.push(crate::job::FileEntry {
            path: std::path::PathBuf::from(name),
            content,
            executable: false,
        });
    }
    Ok(out)
}

/// Folds request-level overrides against engine defaults: negative or
/// absent memory limits mean unlimited (subject to the engine's ceiling),
/// absent timeouts fall back to the supplied defaults.
pub fn resolve_limits(
    spec: &JobSpec,
    default_run_ms: u64,
    default_compile_ms: u64,
) -> (u64, u64, Option<u64>, Option<u64>) {
    let run_ms = spec.run_timeout.unwrap_or(default_run_ms);
    let compile_ms = spec.compile_timeout.unwrap_or(default_compile_ms);
    let run_bytes = spec.run_memory_limit.and_then(|b| if b < 0 { None } else { Some(b as u64) });
    let compile_bytes = spec
        .compile_memory_limit
        .and_then(|b| if b < 0 { None } else { Some(b as u64) });
    (run_ms, compile_ms, run_bytes, compile_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_values_match_protocol_table() {
        assert_eq!(CloseCode::AlreadyInitialized.code(), 4000);
        assert_eq!(CloseCode::InitTimeout.code(), 4001);
        assert_eq!(CloseCode::JobCompleted.code(), 4999);
    }

    #[test]
    fn decode_files_assigns_default_names() {
        let files = vec![FileSpec {
            name: None,
            content: "print(1)".to_string(),
            encoded: false,
        }];
        let entries = decode_files(&files).unwrap();
        assert_eq!(entries[0].path, std::path::PathBuf::from("file0"));
        assert_eq!(entries[0].content, b"print(1)");
    }

    #[test]
    fn decode_files_base64_roundtrip() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\x00\x01binary");
        let files = vec![FileSpec {
            name: Some("main.bin".to_string()),
            content: encoded,
            encoded: true,
        }];
        let entries = decode_files(&files).unwrap();
        assert_eq!(entries[0].content, b"\x00\x01binary");
    }

    #[test]
    fn negative_memory_limit_means_unlimited() {
        let spec = JobSpec {
            language: "python".to_string(),
            version: "3.10".to_string(),
            files: vec![],
            args: vec![],
            stdin: String::new(),
            run_timeout: None,
            compile_timeout: None,
            run_memory_limit: Some(-1),
            compile_memory_limit: Some(256_000_000),
        };
        let (run_ms, compile_ms, run_bytes, compile_bytes) = resolve_limits(&spec, 5000, 10_000);
        assert_eq!(run_ms, 5000);
        assert_eq!(compile_ms, 10_000);
        assert_eq!(run_bytes, None);
        assert_eq!(compile_bytes, Some(256_000_000));
    }
}
