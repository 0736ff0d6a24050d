//! Spawns a job's child process and turns its two output pipes into a
//! single ordered event stream: zero or more `Output` chunks, then exactly
//! one `Exited` carrying the exit code.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::OutputChunk;
use crate::scheduler::job::{ExitCode, JobRequest};

const READ_CHUNK: usize = 8192;
const EVENT_CAPACITY: usize = 32;

#[derive(Debug)]
pub enum ExecEvent {
    Output(OutputChunk),
    Exited(ExitCode),
}

/// Starts the child described by `request`. Cancelling `cancel` kills the
/// child; the resulting signal exit is reported through the normal `Exited`
/// event. Fails only if the process cannot be spawned at all.
pub fn start(
    request: &JobRequest,
    cancel: CancellationToken,
) -> std::io::Result<mpsc::Receiver<ExecEvent>> {
    let mut command = Command::new(&request.command);
    command
        .args(&request.args)
        .current_dir(&request.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(env) = &request.env {
        command.env_clear().envs(env);
    }

    let mut child = command.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

    let out_pump = stdout.map(|pipe| tokio::spawn(pump(pipe, tx.clone(), OutputChunk::Stdout)));
    let err_pump = stderr.map(|pipe| tokio::spawn(pump(pipe, tx.clone(), OutputChunk::Stderr)));

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };

        // Drain both pipes before reporting the exit, so `Exited` is always
        // the final event.
        if let Some(pump) = out_pump {
            let _ = pump.await;
        }
        if let Some(pump) = err_pump {
            let _ = pump.await;
        }

        let exit = match status {
            Ok(status) if status.success() => ExitCode::Success,
            Ok(status) => match status.code() {
                Some(code) => ExitCode::Failure(code),
                None => ExitCode::Failure(signal_exit_code(&status)),
            },
            Err(_) => ExitCode::Failure(-1),
        };
        let _ = tx.send(ExecEvent::Exited(exit)).await;
    });

    Ok(rx)
}

async fn pump<R>(mut pipe: R, tx: mpsc::Sender<ExecEvent>, wrap: fn(Vec<u8>) -> OutputChunk)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(ExecEvent::Output(wrap(buf[..n].to_vec()))).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(unix)]
fn signal_exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map_or(-1, |signal| 128 + signal)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &std::process::ExitStatus) -> i32 {
    -1
}
