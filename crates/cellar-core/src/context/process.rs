//! Subprocess-backed context.
//!
//! The runtime is an external program speaking newline-delimited JSON over
//! stdin/stdout. Every request carries an `id`; responses may arrive in any
//! order and are matched back by that id.
//!
//! ```text
//! > {"id":0,"op":"list_functions"}
//! < {"id":0,"functions":["fit","plot"]}
//! > {"id":1,"op":"run_code","source":"x + 1"}
//! < {"id":1,"output":{"type":"integer","value":6},"errors":[]}
//! ```
//!
//! Values always travel packed on the wire.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use super::{CallArgument, CallOptions, CallResult, Context, ContextError, ContextFuture};
use crate::error::ErrorRecord;
use crate::value::{Payload, pack, unpack};

/// Request line sent to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: Operation,
}

/// What the runtime is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Report the functions `call_function` accepts.
    ListFunctions,
    CallFunction {
        name: String,
        args: Vec<WireArgument>,
    },
    CallCode {
        source: String,
        args: Map<String, Json>,
    },
    RunCode {
        source: String,
    },
}

/// Positional or named argument of a function call, packed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireArgument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: Json,
}

/// Response line read from the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub output: Option<Json>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    /// Only set in answer to `list_functions`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<String>,
}

type Reply = oneshot::Sender<Result<Response, ContextError>>;

/// Context that forwards every call to a runtime subprocess.
#[derive(Debug)]
pub struct ProcessContext {
    program: PathBuf,
    functions: FxHashSet<String>,
    requests: mpsc::UnboundedSender<(Request, Reply)>,
    next_id: AtomicU64,
}

impl ProcessContext {
    /// Start `program` and ask it which functions it offers.
    ///
    /// The program is looked up on `PATH` unless it is a path already.
    pub async fn spawn<S: AsRef<OsStr>>(program: S, args: &[String]) -> Result<Self, ContextError> {
        let program_name = program.as_ref().to_string_lossy().to_string();
        let program = which::which(program.as_ref()).map_err(|e| ContextError::Spawn {
            program: program_name.clone(),
            reason: e.to_string(),
        })?;

        let mut child = Command::new(&program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContextError::Spawn {
                program: program_name.clone(),
                reason: e.to_string(),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ContextError::Transport("failed to get runtime stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ContextError::Transport("failed to get runtime stdout".to_string()))?;

        let (requests, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(child, stdin, stdout, rx));

        let mut context = Self {
            program,
            functions: FxHashSet::default(),
            requests,
            next_id: AtomicU64::new(0),
        };

        let listing = context.request(Operation::ListFunctions).await?;
        context.functions = listing.functions.into_iter().collect();
        tracing::info!(
            "Started runtime {} offering {} function(s)",
            context.program.display(),
            context.functions.len()
        );
        Ok(context)
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    fn request(&self, op: Operation) -> impl Future<Output = Result<Response, ContextError>> + Send + 'static {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, answer) = oneshot::channel();
        let sent = self.requests.send((Request { id, op }, reply));
        async move {
            sent.map_err(|_| ContextError::Transport("runtime is not running".to_string()))?;
            answer.await.map_err(|_| {
                ContextError::Transport("runtime exited before answering".to_string())
            })?
        }
    }

    fn call(&self, op: Operation, options: CallOptions) -> ContextFuture {
        let response = self.request(op);
        async move { into_call_result(response.await?, options) }.boxed()
    }
}

impl Context for ProcessContext {
    fn has_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    fn call_function(
        &self,
        name: &str,
        args: Vec<CallArgument>,
        options: CallOptions,
    ) -> ContextFuture {
        let args = args
            .into_iter()
            .map(|(name, payload)| WireArgument {
                name,
                value: envelope(payload),
            })
            .collect();
        self.call(
            Operation::CallFunction {
                name: name.to_string(),
                args,
            },
            options,
        )
    }

    fn call_code(
        &self,
        source: &str,
        args: IndexMap<String, Payload>,
        options: CallOptions,
    ) -> ContextFuture {
        let args = args
            .into_iter()
            .map(|(name, payload)| (name, envelope(payload)))
            .collect();
        self.call(
            Operation::CallCode {
                source: source.to_string(),
                args,
            },
            options,
        )
    }

    fn run_code(&self, source: &str, options: CallOptions) -> ContextFuture {
        self.call(
            Operation::RunCode {
                source: source.to_string(),
            },
            options,
        )
    }
}

/// Wire form of a payload; native payloads are packed on the way out.
fn envelope(payload: Payload) -> Json {
    match payload {
        Payload::Native(value) => pack(&value),
        Payload::Packed(envelope) => envelope,
    }
}

fn into_call_result(response: Response, options: CallOptions) -> Result<CallResult, ContextError> {
    let output = match response.output {
        None | Some(Json::Null) => None,
        Some(envelope) if options.pack => Some(Payload::Packed(envelope)),
        Some(envelope) => Some(Payload::Native(
            unpack(&envelope).map_err(|e| ContextError::Protocol(e.to_string()))?,
        )),
    };
    Ok(CallResult {
        output,
        errors: response.errors,
    })
}

/// Move requests to the runtime and route its responses back.
async fn pump(
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    mut rx: mpsc::UnboundedReceiver<(Request, Reply)>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut pending: FxHashMap<u64, Reply> = FxHashMap::default();

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some((request, reply)) = request else {
                    break;
                };
                let mut line = match serde_json::to_string(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = reply.send(Err(ContextError::Protocol(e.to_string())));
                        continue;
                    }
                };
                line.push('\n');
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;
                match written {
                    Ok(()) => {
                        pending.insert(request.id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(ContextError::Transport(e.to_string())));
                    }
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Response>(&line) {
                        Ok(response) => match pending.remove(&response.id) {
                            Some(reply) => {
                                let _ = reply.send(Ok(response));
                            }
                            None => tracing::warn!("Runtime answered unknown request {}", response.id),
                        },
                        Err(e) => tracing::warn!("Ignoring malformed runtime output: {}", e),
                    }
                }
                Ok(None) | Err(_) => {
                    tracing::warn!("Runtime closed its output with {} request(s) pending", pending.len());
                    break;
                }
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(ContextError::Transport("runtime exited".to_string())));
    }
    let _ = child.kill().await;
}
