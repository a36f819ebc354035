//! Out-of-process connectors.
//!
//! [`ProcessConnector`] implements every capability trait by forwarding each
//! call to a child process over newline-delimited JSON on its stdin/stdout.
//! Unstable native integrations can run in their own process this way and
//! still be pooled, throttled, and classified like in-process connectors.
//!
//! # Protocol
//!
//! Every request is one line: an object tagged by `op` (`connect`,
//! `disconnect`, `poll`, `check`, `enumerate_seeds`, `document_version`,
//! `fetch_document`, `transform_document`, `add_or_replace_document`,
//! `remove_document`, `note_job_complete`). The child answers with any
//! number of progress lines followed by exactly one final line, each an
//! object tagged by `type`:
//!
//! - `{"type":"seed","identifier":"..."}`: a discovered seed (progress)
//! - `{"type":"activity","activity_type":"...","entity_id":"...","result_code":"..."}`: an accounting record (progress)
//! - `{"type":"ok","result":...}`: success, with an op-specific result
//! - `{"type":"error","error":{...}}`: a serialized `ConnectorError`
//!
//! Connection parameters: `command` (required) and `args` (optional JSON
//! array of strings). The whole parameter set is forwarded in `connect`.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use harvester_types::connection::ConfigParams;
use harvester_types::error::{ConnectorError, ValidationResult};
use harvester_types::spec::Specification;

use crate::activity::{ActivityCallback, SeedingActivity};
use crate::connector::{
    default_check, Connector, FetchOutcome, IngestResult, OutputConnector, RepositoryConnector,
    TransformationConnector,
};
use crate::document::RepositoryDocument;

/// Connector kind identifier under which the engine registers this bridge.
pub const PROCESS_CONNECTOR_KIND: &str = "process";

const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Connect {
        config: &'a ConfigParams,
    },
    Disconnect,
    Poll,
    Check,
    EnumerateSeeds {
        spec: &'a Specification,
        since: Option<DateTime<Utc>>,
    },
    DocumentVersion {
        identifier: &'a str,
        spec: &'a Specification,
    },
    FetchDocument {
        identifier: &'a str,
        version: &'a str,
        spec: &'a Specification,
    },
    TransformDocument {
        uri: &'a str,
        version: &'a str,
        document: &'a RepositoryDocument,
        spec: &'a Specification,
    },
    AddOrReplaceDocument {
        uri: &'a str,
        version: &'a str,
        document: &'a RepositoryDocument,
        spec: &'a Specification,
    },
    RemoveDocument {
        uri: &'a str,
        version: Option<&'a str>,
    },
    NoteJobComplete,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Response {
    Ok {
        #[serde(default)]
        result: Value,
    },
    Error {
        error: ConnectorError,
    },
    Seed {
        identifier: String,
    },
    Activity {
        activity_type: String,
        #[serde(default)]
        byte_count: Option<u64>,
        entity_id: String,
        result_code: String,
        #[serde(default)]
        description: Option<String>,
    },
}

/// Which callbacks progress lines are routed to.
#[derive(Clone, Copy)]
enum Callbacks<'a> {
    None,
    Activity(&'a dyn ActivityCallback),
    Seeding(&'a dyn SeedingActivity),
}

struct ChildIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A connector whose implementation lives in a child process.
#[derive(Default)]
pub struct ProcessConnector {
    io: Option<ChildIo>,
}

impl ProcessConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(config: &ConfigParams) -> Result<ChildIo, ConnectorError> {
        let program = config
            .get("command")
            .ok_or_else(|| ConnectorError::config("MISSING_COMMAND", "'command' is required"))?;
        let args: Vec<String> = match config.get("args") {
            None => Vec::new(),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                ConnectorError::config("BAD_ARGS", format!("'args' must be a JSON string array: {e}"))
            })?,
        };
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ConnectorError::setup("SPAWN_FAILED", format!("{program}: {e}")))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(ConnectorError::setup("SPAWN_FAILED", "child pipes unavailable"));
        };
        Ok(ChildIo {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Send one request and read until its final line.
    fn call(&mut self, request: &Request<'_>, callbacks: Callbacks<'_>) -> Result<Value, ConnectorError> {
        let result = self.exchange(request, callbacks);
        if let Err(err) = &result {
            if err.code == "PROCESS_IO" {
                // The pipe is broken; drop the child so the pool discards us.
                self.shutdown();
            }
        }
        result
    }

    fn exchange(&mut self, request: &Request<'_>, callbacks: Callbacks<'_>) -> Result<Value, ConnectorError> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| ConnectorError::internal("NOT_CONNECTED", "process connector is not connected"))?;
        let mut line = serde_json::to_string(request)
            .map_err(|e| ConnectorError::internal("ENCODE", e.to_string()))?;
        line.push('\n');
        io.stdin
            .write_all(line.as_bytes())
            .and_then(|()| io.stdin.flush())
            .map_err(io_error)?;

        loop {
            let mut reply = String::new();
            let read = io.stdout.read_line(&mut reply).map_err(io_error)?;
            if read == 0 {
                return Err(ConnectorError::service_interruption(
                    "PROCESS_IO",
                    "connector process closed its output",
                    None,
                ));
            }
            if reply.trim().is_empty() {
                continue;
            }
            let response: Response = serde_json::from_str(reply.trim()).map_err(|e| {
                ConnectorError::internal("DECODE", format!("bad reply from connector process: {e}"))
            })?;
            match response {
                Response::Ok { result } => return Ok(result),
                Response::Error { error } => return Err(error),
                Response::Seed { identifier } => match callbacks {
                    Callbacks::Seeding(seeding) => seeding.add_seed(identifier)?,
                    _ => {
                        return Err(ConnectorError::internal(
                            "UNEXPECTED_SEED",
                            "seed reported outside of seeding",
                        ))
                    }
                },
                Response::Activity {
                    activity_type,
                    byte_count,
                    entity_id,
                    result_code,
                    description,
                } => {
                    let activity: Option<&dyn ActivityCallback> = match callbacks {
                        Callbacks::None => None,
                        Callbacks::Activity(a) => Some(a),
                        Callbacks::Seeding(s) => {
                            s.record_activity(
                                None,
                                &activity_type,
                                byte_count,
                                &entity_id,
                                &result_code,
                                description.as_deref(),
                            );
                            None
                        }
                    };
                    if let Some(a) = activity {
                        a.record_activity(
                            None,
                            &activity_type,
                            byte_count,
                            &entity_id,
                            &result_code,
                            description.as_deref(),
                        );
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let Some(ChildIo {
            mut child, stdin, ..
        }) = self.io.take()
        else {
            return;
        };
        drop(stdin);
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
                _ => break,
            }
        }
        if let Err(e) = child.kill() {
            tracing::debug!(error = %e, "connector process already gone");
        }
        let _ = child.wait();
    }
}

fn io_error(e: std::io::Error) -> ConnectorError {
    ConnectorError::service_interruption("PROCESS_IO", e.to_string(), None)
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, ConnectorError> {
    serde_json::from_value(value)
        .map_err(|e| ConnectorError::internal("DECODE", format!("bad {what} result: {e}")))
}

impl Drop for ProcessConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Connector for ProcessConnector {
    fn connect(&mut self, config: &ConfigParams) -> Result<(), ConnectorError> {
        self.shutdown();
        self.io = Some(Self::spawn(config)?);
        self.call(&Request::Connect { config }, Callbacks::None)?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ConnectorError> {
        if self.io.is_none() {
            return Ok(());
        }
        let result = self.call(&Request::Disconnect, Callbacks::None).map(|_| ());
        self.shutdown();
        result
    }

    fn poll(&mut self) -> Result<(), ConnectorError> {
        self.call(&Request::Poll, Callbacks::None).map(|_| ())
    }

    fn check(&mut self) -> Result<ValidationResult, ConnectorError> {
        match self.call(&Request::Check, Callbacks::None)? {
            Value::Null => default_check(),
            value => decode(value, "check"),
        }
    }

    fn is_connected(&self) -> bool {
        self.io.is_some()
    }
}

impl RepositoryConnector for ProcessConnector {
    fn enumerate_seeds(
        &mut self,
        activity: &dyn SeedingActivity,
        spec: &Specification,
        since: Option<DateTime<Utc>>,
    ) -> Result<(), ConnectorError> {
        self.call(
            &Request::EnumerateSeeds { spec, since },
            Callbacks::Seeding(activity),
        )
        .map(|_| ())
    }

    fn document_version(
        &mut self,
        identifier: &str,
        spec: &Specification,
        activity: &dyn ActivityCallback,
    ) -> Result<Option<String>, ConnectorError> {
        let value = self.call(
            &Request::DocumentVersion { identifier, spec },
            Callbacks::Activity(activity),
        )?;
        decode(value, "document_version")
    }

    fn fetch_document(
        &mut self,
        identifier: &str,
        version: &str,
        spec: &Specification,
        activity: &dyn ActivityCallback,
    ) -> Result<FetchOutcome, ConnectorError> {
        let value = self.call(
            &Request::FetchDocument {
                identifier,
                version,
                spec,
            },
            Callbacks::Activity(activity),
        )?;
        decode(value, "fetch_document")
    }
}

impl TransformationConnector for ProcessConnector {
    fn transform_document(
        &mut self,
        uri: &str,
        version: &str,
        document: RepositoryDocument,
        spec: &Specification,
        activity: &dyn ActivityCallback,
    ) -> Result<Option<RepositoryDocument>, ConnectorError> {
        let value = self.call(
            &Request::TransformDocument {
                uri,
                version,
                document: &document,
                spec,
            },
            Callbacks::Activity(activity),
        )?;
        decode(value, "transform_document")
    }
}

impl OutputConnector for ProcessConnector {
    fn add_or_replace_document(
        &mut self,
        uri: &str,
        version: &str,
        document: &RepositoryDocument,
        spec: &Specification,
        activity: &dyn ActivityCallback,
    ) -> Result<IngestResult, ConnectorError> {
        match self.call(
            &Request::AddOrReplaceDocument {
                uri,
                version,
                document,
                spec,
            },
            Callbacks::Activity(activity),
        )? {
            Value::Null => Ok(IngestResult::Accepted),
            value => decode(value, "add_or_replace_document"),
        }
    }

    fn remove_document(
        &mut self,
        uri: &str,
        version: Option<&str>,
        activity: &dyn ActivityCallback,
    ) -> Result<(), ConnectorError> {
        self.call(
            &Request::RemoveDocument { uri, version },
            Callbacks::Activity(activity),
        )
        .map(|_| ())
    }

    fn note_job_complete(&mut self, activity: &dyn ActivityCallback) -> Result<(), ConnectorError> {
        self.call(&Request::NoteJobComplete, Callbacks::Activity(activity))
            .map(|_| ())
    }
}
