//! Client-side connection to a running server.

use std::io::Write;

use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::{Result, TparError};
use crate::protocol::codec::{self, FrameCodec};
use crate::protocol::{ClientReply, ClientRequest, Hello, JobView, OutputChunk, SinkSpec};
use crate::scheduler::job::{JobId, JobRequest};
use crate::scheduler::matcher::JobMatch;

pub struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
}

impl Connection {
    /// Connects and completes the hello exchange.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TparError::Connect { addr, source })?;
        let mut framed = Framed::new(stream, FrameCodec::new());

        codec::send(&mut framed, &Hello::Client).await?;
        match codec::recv::<_, ClientReply>(&mut framed).await? {
            Some(ClientReply::Welcome) => Ok(Self { framed }),
            Some(_) => Err(TparError::Protocol("expected a welcome".to_string())),
            None => Err(TparError::Disconnected),
        }
    }

    pub async fn enqueue(&mut self, request: JobRequest, sink: SinkSpec) -> Result<JobId> {
        codec::send(&mut self.framed, &ClientRequest::Enqueue { request, sink }).await?;
        match self.reply().await? {
            ClientReply::Enqueued { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// After an enqueue with a streamed sink: copies the job's output to
    /// this process's stdout and stderr until the job ends, then returns
    /// the exit code this process should finish with.
    pub async fn watch(&mut self) -> Result<i32> {
        loop {
            match self.reply().await? {
                ClientReply::Output(chunk) => forward_chunk(&chunk)?,
                ClientReply::Done { exit } => return Ok(exit.code()),
                ClientReply::StreamFailed { reason } => {
                    eprintln!("tpar: job failed: {reason}");
                    return Ok(1);
                }
                other => return Err(unexpected(other)),
            }
        }
    }

    pub async fn status(&mut self, matcher: JobMatch) -> Result<Vec<JobView>> {
        codec::send(&mut self.framed, &ClientRequest::Status(matcher)).await?;
        match self.reply().await? {
            ClientReply::Jobs(jobs) => Ok(jobs),
            other => Err(unexpected(other)),
        }
    }

    pub async fn kill(&mut self, matcher: JobMatch) -> Result<Vec<JobView>> {
        codec::send(&mut self.framed, &ClientRequest::Kill(matcher)).await?;
        match self.reply().await? {
            ClientReply::Jobs(jobs) => Ok(jobs),
            other => Err(unexpected(other)),
        }
    }

    pub async fn rerun(&mut self, matcher: JobMatch) -> Result<Vec<JobView>> {
        codec::send(&mut self.framed, &ClientRequest::Rerun(matcher)).await?;
        match self.reply().await? {
            ClientReply::Jobs(jobs) => Ok(jobs),
            other => Err(unexpected(other)),
        }
    }

    async fn reply(&mut self) -> Result<ClientReply> {
        match codec::recv::<_, ClientReply>(&mut self.framed).await? {
            Some(reply) => Ok(reply),
            None => Err(TparError::Disconnected),
        }
    }
}

fn unexpected(reply: ClientReply) -> TparError {
    TparError::Protocol(format!("unexpected reply: {reply:?}"))
}

fn forward_chunk(chunk: &OutputChunk) -> Result<()> {
    match chunk {
        OutputChunk::Stdout(data) => {
            let mut out = std::io::stdout().lock();
            out.write_all(data)?;
            out.flush()?;
        }
        OutputChunk::Stderr(data) => {
            let mut err = std::io::stderr().lock();
            err.write_all(data)?;
            err.flush()?;
        }
    }
    Ok(())
}
