//! In-process typed request/reply primitive.
//!
//! An endpoint is a pair: an [`RpcClient`] that sends a request and awaits
//! the reply, and an `mpsc::Receiver<Rpc<Req, Resp>>` the serving task
//! drains. Every call carries a fresh caller-private oneshot, so replies
//! correlate themselves and are delivered exactly once.
//!
//! A handler may reply inline (`rpc.reply(resp)`) or split the call with
//! [`Rpc::into_parts`] and move the [`Replier`] into a background task that
//! replies later. Dropping the `Replier` without replying surfaces to the
//! caller as [`RpcError::NoReply`], which is how peer death is observed.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// The serving side no longer exists.
    #[error("rpc endpoint closed")]
    Closed,

    /// The call was delivered but the reply channel was dropped unanswered.
    #[error("rpc call dropped without a reply")]
    NoReply,
}

/// One in-flight call: the request plus its reply capability.
#[derive(Debug)]
pub struct Rpc<Req, Resp> {
    request: Req,
    reply: Replier<Resp>,
}

impl<Req, Resp> Rpc<Req, Resp> {
    pub fn request(&self) -> &Req {
        &self.request
    }

    pub fn reply(self, resp: Resp) {
        self.reply.reply(resp);
    }

    pub fn into_parts(self) -> (Req, Replier<Resp>) {
        (self.request, self.reply)
    }
}

/// The serving half of one call.
#[derive(Debug)]
pub struct Replier<Resp>(oneshot::Sender<Resp>);

impl<Resp> Replier<Resp> {
    pub fn reply(self, resp: Resp) -> bool {
        self.0.send(resp).is_ok()
    }

    /// Resolves when the caller has gone away. Lets a deferred handler
    /// abandon work nobody is waiting for.
    pub async fn closed(&mut self) {
        self.0.closed().await
    }
}

#[derive(Debug)]
pub struct RpcClient<Req, Resp> {
    tx: mpsc::Sender<Rpc<Req, Resp>>,
}

impl<Req, Resp> Clone for RpcClient<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Resp> RpcClient<Req, Resp> {
    /// Sends `request` and blocks the caller until the reply arrives.
    pub async fn call(&self, request: Req) -> Result<Resp, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Rpc {
                request,
                reply: Replier(tx),
            })
            .await
            .map_err(|_| RpcError::Closed)?;
        rx.await.map_err(|_| RpcError::NoReply)
    }
}

pub fn channel<Req, Resp>(capacity: usize) -> (RpcClient<Req, Resp>, mpsc::Receiver<Rpc<Req, Resp>>) {
    let (tx, rx) = mpsc::channel(capacity);
    (RpcClient { tx }, rx)
}
