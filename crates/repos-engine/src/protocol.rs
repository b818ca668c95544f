//! The external-tool control protocol.
//!
//! External tools talk to the engine over their stdout/stdin with
//! one-byte line commands:
//!
//! | Byte | Meaning |
//! |---|---|
//! | `S` | add source (trailing `/` = recursive) |
//! | `I` | add input (trailing `/` = recursive) |
//! | `O` | add output, `key:path` or `path` |
//! | `G` | add generated file/dir |
//! | `P` | add one opaque string |
//! | `V` | verify cache; engine answers `1` or `0` on stdin |
//! | `C` | clear saved state |
//! | `X` | terminate as skipped |
//!
//! Declarations are recorded and, after a normal exit, replayed onto a
//! fresh cache so inputs are re-stat'ed and output mtimes reflect the run.

use repos_cache::{FilesCache, OutputFiles};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::context::ExecContext;
use crate::{Error, ExecStatus, Result};

/// One recorded cache declaration.
#[derive(Debug, Clone)]
enum CacheOp {
    Source { path: String, recursive: bool },
    Input { path: String, recursive: bool },
    Output { key: String, path: String },
    Generated(String),
    Opaque(String),
}

/// A cache wrapper that records every declaration so it can be replayed
/// onto a fresh cache after the tool has run.
pub struct CacheRecorder {
    cache: FilesCache,
    ops: Vec<CacheOp>,
}

impl CacheRecorder {
    #[must_use]
    pub fn new(cache: FilesCache) -> Self {
        Self {
            cache,
            ops: Vec::new(),
        }
    }

    pub fn add_source(&mut self, path: &str, recursive: bool) -> Result<()> {
        self.cache.add_source(path, recursive)?;
        self.ops.push(CacheOp::Source {
            path: path.to_string(),
            recursive,
        });
        Ok(())
    }

    pub fn add_input(&mut self, path: &str, recursive: bool) -> Result<()> {
        self.cache.add_input(path, recursive)?;
        self.ops.push(CacheOp::Input {
            path: path.to_string(),
            recursive,
        });
        Ok(())
    }

    pub fn add_output(&mut self, key: &str, path: &str) {
        self.cache.add_output(key, path);
        self.ops.push(CacheOp::Output {
            key: key.to_string(),
            path: path.to_string(),
        });
    }

    pub fn add_generated(&mut self, path: &str) {
        self.cache.add_generated(path);
        self.ops.push(CacheOp::Generated(path.to_string()));
    }

    pub fn add_opaque<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for value in values {
            let value = value.into();
            self.cache.add_opaque([value.clone()]);
            self.ops.push(CacheOp::Opaque(value));
        }
    }

    pub fn verify(&mut self) -> bool {
        self.cache.verify()
    }

    pub fn clear_saved(&self) -> Result<()> {
        Ok(self.cache.clear_saved()?)
    }

    #[must_use]
    pub fn saved_task_outputs(&self) -> Option<OutputFiles> {
        self.cache.saved_task_outputs().cloned()
    }

    /// Replay every recorded declaration onto another cache.
    pub fn replay(&self, cache: &mut FilesCache) -> Result<()> {
        for op in &self.ops {
            match op {
                CacheOp::Source { path, recursive } => cache.add_source(path, *recursive)?,
                CacheOp::Input { path, recursive } => cache.add_input(path, *recursive)?,
                CacheOp::Output { key, path } => cache.add_output(key, path),
                CacheOp::Generated(path) => cache.add_generated(path),
                CacheOp::Opaque(value) => cache.add_opaque([value.clone()]),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolOutcome {
    /// The tool ran to completion and reported declarations.
    Ran,
    /// The tool asked to skip (`X`).
    Skip,
}

/// Interpret protocol lines from `reader`, answering `V` on `writer`.
pub(crate) async fn drive_protocol<R, W>(
    skippable: bool,
    recorder: &mut CacheRecorder,
    writer: &mut W,
    reader: R,
) -> Result<ProtocolOutcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| Error::configuration(format!("read tool output: {e}")))?
    {
        if line.is_empty() || !line.is_char_boundary(1) {
            continue;
        }
        let (cmd, val) = line.split_at(1);
        match cmd.as_bytes()[0] {
            b'S' => {
                if let Some(dir) = val.strip_suffix('/') {
                    recorder.add_source(dir, true)?;
                } else {
                    recorder.add_source(val, false)?;
                }
            }
            b'I' => {
                if let Some(dir) = val.strip_suffix('/') {
                    recorder.add_input(dir, true)?;
                } else {
                    recorder.add_input(val, false)?;
                }
            }
            b'O' => {
                let (key, path) = match val.split_once(':') {
                    Some((key, path)) => (key, path),
                    None => ("", val),
                };
                recorder.add_output(key, path);
            }
            b'G' => recorder.add_generated(val),
            b'P' => recorder.add_opaque([val]),
            b'V' => {
                let up_to_date = skippable && recorder.verify();
                writer
                    .write_all(if up_to_date { b"1\n" } else { b"0\n" })
                    .await
                    .map_err(|e| Error::configuration(format!("answer tool: {e}")))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| Error::configuration(format!("answer tool: {e}")))?;
            }
            b'C' => recorder.clear_saved()?,
            b'X' => return Ok(ProtocolOutcome::Skip),
            _ => {}
        }
    }
    Ok(ProtocolOutcome::Ran)
}

/// Run an external program as a tool over the control protocol.
///
/// The command line and rendered env bindings seed the opaque list, so a
/// changed invocation invalidates the cache even if the tool reports the
/// same declarations.
pub async fn run_external(
    ctx: &mut ExecContext,
    mut cmd: Command,
    envs: &[String],
) -> Result<ExecStatus> {
    ctx.add_bin_paths(&mut cmd);
    ctx.extend_env(&mut cmd, envs);

    let opaque_args: Vec<String> = {
        let std_cmd = cmd.as_std();
        std::iter::once(std_cmd.get_program().to_string_lossy().into_owned())
            .chain(
                std_cmd
                    .get_args()
                    .map(|a| a.to_string_lossy().into_owned()),
            )
            .collect()
    };

    let (mut child, display) = ctx.spawn_controlled(cmd)?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::configuration("missing stdin pipe"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::configuration("missing stdout pipe"))?;

    let mut recorder = CacheRecorder::new(ctx.cache());
    recorder.add_opaque(opaque_args);
    recorder.add_opaque(envs.iter().cloned());

    let cancel = ctx.cancel_token();
    let reader = BufReader::new(stdout);
    let control = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Canceled),
        outcome = drive_protocol(ctx.skippable, &mut recorder, &mut stdin, reader) => outcome,
    };
    drop(stdin);

    if control.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    let control = control?;

    let waited = tokio::select! {
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status),
    };
    let Some(status) = waited else {
        let _ = child.start_kill();
        let _ = child.wait().await;
        ctx.log.line(format!("CMD CANCELED {display}"));
        return Err(Error::Canceled);
    };
    let status =
        status.map_err(|e| Error::configuration(format!("wait command {display} error: {e}")))?;

    match control {
        ProtocolOutcome::Skip => {
            let outputs = recorder
                .saved_task_outputs()
                .or_else(|| ctx.load_saved_outputs())
                .unwrap_or_default();
            ctx.publish_outputs(outputs);
            ctx.log.line(format!("CMD DONE {display} (skip)"));
            Ok(ExecStatus::Skipped)
        }
        ProtocolOutcome::Ran => {
            if !status.success() {
                ctx.log.line(format!("CMD FAILED {display}: {status}"));
                return Err(Error::CommandFailed {
                    command: display,
                    status,
                });
            }
            let mut fresh = ctx.cache();
            match recorder.replay(&mut fresh) {
                Ok(()) => {
                    ctx.persist_cache_or_log(&mut fresh);
                    ctx.publish_outputs(fresh.task_outputs().clone());
                }
                Err(e) => {
                    ctx.log.line(format!("Refresh cache error: {e}"));
                    ctx.publish_outputs(recorder.cache.task_outputs().clone());
                }
            }
            ctx.log.line(format!("CMD DONE {display}"));
            Ok(ExecStatus::Completed)
        }
    }
}
