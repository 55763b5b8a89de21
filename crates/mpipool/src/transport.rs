//! Controller side of the socket link to one worker process group.
//!
//! The controller binds a TCP listener on an ephemeral port, passes the
//! endpoint to the launched entry point, and accepts one connection per
//! rank. Every call is broadcast to all ranks. A single rank's value is the
//! result; with several ranks the values come back as an array in rank order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::codec::WireCodec;
use crate::error::PoolError;
use crate::launch::{LaunchHandle, WorkerCommand};
use crate::protocol::{Call, RemoteError, Reply, Request};
use crate::traits::Launcher;

/// One connected rank.
struct RankConnection {
    rank: u32,
    stream: BufStream<TcpStream>,
}

/// Listener, rank connections and launch handle of one worker slot.
pub struct Transport {
    slot: usize,
    codec: WireCodec,
    listener: TcpListener,
    endpoint: SocketAddr,
    ranks: Vec<RankConnection>,
    handle: Option<LaunchHandle>,
    launcher: Option<Arc<dyn Launcher>>,
    grace: Duration,
}

impl Transport {
    /// Bind a listener on an ephemeral port of `host`.
    pub async fn bind(slot: usize, host: &str, codec: WireCodec) -> Result<Self, PoolError> {
        let listener = TcpListener::bind((host, 0)).await?;
        let endpoint = listener.local_addr()?;
        debug!(slot, %endpoint, "transport listening");
        Ok(Self {
            slot,
            codec,
            listener,
            endpoint,
            ranks: Vec::new(),
            handle: None,
            launcher: None,
            grace: Duration::from_secs(5),
        })
    }

    /// Time a process group gets to exit after a waiting shutdown.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Address the entry point must connect to.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Number of connected ranks.
    pub fn ranks(&self) -> usize {
        self.ranks.len()
    }

    /// Launch the process group and wait until every rank has connected.
    ///
    /// Fails with [`PoolError::Bootup`] if the launcher fails or the group
    /// exits before the handshake completes.
    #[instrument(skip_all, fields(slot = self.slot, launcher = launcher.name()))]
    pub async fn bootup(
        &mut self,
        launcher: Arc<dyn Launcher>,
        command: &WorkerCommand,
    ) -> Result<(), PoolError> {
        let slot = self.slot;
        let expected = launcher.ranks();
        let command = command.with_endpoint(self.endpoint);

        let mut handle = launcher
            .bootup(&command)
            .await
            .map_err(|e| bootup_error(slot, e))?;

        let accepted = tokio::select! {
            accepted = accept_ranks(&self.listener, self.codec, expected) => accepted,
            status = handle.exited() => Err(PoolError::Communication(format!(
                "process group exited before all ranks connected ({status})"
            ))),
        };

        match accepted {
            Ok(ranks) => {
                debug!(ranks = ranks.len(), "all ranks connected");
                self.ranks = ranks;
                self.handle = Some(handle);
                self.launcher = Some(launcher);
                Ok(())
            }
            Err(e) => {
                let _ = launcher.shutdown(&mut handle, false, self.grace).await;
                Err(bootup_error(slot, e))
            }
        }
    }

    /// Send one call to every rank and collect the replies.
    ///
    /// The outer error is a broken link; the inner one is a failure raised by
    /// the function. With a single rank its value is returned as is, with
    /// several the values come back as an array in rank order. If any rank
    /// failed, the lowest rank's error is returned.
    pub async fn send_and_receive(
        &mut self,
        id: Uuid,
        call: Call,
    ) -> Result<Result<Value, RemoteError>, PoolError> {
        if self.ranks.is_empty() {
            return Err(PoolError::Communication("transport is not connected".into()));
        }
        let request = call.into_request(id);
        for conn in &mut self.ranks {
            self.codec
                .write_frame(&mut conn.stream, &request)
                .await
                .map_err(|e| link_error(conn.rank, e))?;
        }

        let mut values = Vec::with_capacity(self.ranks.len());
        let mut first_error = None;
        for conn in &mut self.ranks {
            let reply: Reply = self
                .codec
                .read_frame(&mut conn.stream)
                .await
                .map_err(|e| link_error(conn.rank, e))?
                .ok_or_else(|| {
                    PoolError::Communication(format!(
                        "rank {} closed the connection mid-task",
                        conn.rank
                    ))
                })?;
            match reply {
                Reply::Result { id: reply_id, value } if reply_id == id => values.push(value),
                Reply::Error { id: reply_id, error } if reply_id == id => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                other => {
                    return Err(PoolError::Communication(format!(
                        "rank {} sent an unexpected reply: {other:?}",
                        conn.rank
                    )))
                }
            }
        }

        if let Some(error) = first_error {
            return Ok(Err(error));
        }
        if values.len() == 1 {
            Ok(Ok(values.remove(0)))
        } else {
            Ok(Ok(Value::Array(values)))
        }
    }

    /// Ask every rank to exit, close the sockets and terminate the group.
    pub async fn shutdown(&mut self, wait: bool) -> Result<(), PoolError> {
        let request = Request::Shutdown { wait };
        for conn in &mut self.ranks {
            if let Err(e) = self.codec.write_frame(&mut conn.stream, &request).await {
                debug!(rank = conn.rank, error = %e, "shutdown request not delivered");
            }
        }
        self.ranks.clear();

        match (self.launcher.take(), self.handle.take()) {
            (Some(launcher), Some(mut handle)) => {
                launcher.shutdown(&mut handle, wait, self.grace).await
            }
            _ => Ok(()),
        }
    }

    /// Drop the connections and kill the group without a shutdown request.
    pub async fn abort(&mut self) {
        self.ranks.clear();
        if let (Some(launcher), Some(mut handle)) = (self.launcher.take(), self.handle.take()) {
            if let Err(e) = launcher.shutdown(&mut handle, false, self.grace).await {
                warn!(slot = self.slot, error = %e, "failed to terminate process group");
            }
        }
    }
}

/// Accept `expected` connections and order them by the rank in their hello.
async fn accept_ranks(
    listener: &TcpListener,
    codec: WireCodec,
    expected: usize,
) -> Result<Vec<RankConnection>, PoolError> {
    let mut ranks: Vec<RankConnection> = Vec::with_capacity(expected);
    while ranks.len() < expected {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let mut stream = BufStream::new(socket);
        let hello: Option<Reply> = codec.read_frame(&mut stream).await?;
        let (rank, size) = match hello {
            Some(Reply::Hello { rank, size }) => (rank, size),
            Some(other) => {
                return Err(PoolError::Communication(format!(
                    "expected hello from {peer}, got {other:?}"
                )))
            }
            None => {
                return Err(PoolError::Communication(format!(
                    "{peer} closed the connection before saying hello"
                )))
            }
        };
        if rank as usize >= expected {
            return Err(PoolError::Communication(format!(
                "rank {rank} out of range for a group of {expected}"
            )));
        }
        if ranks.iter().any(|c| c.rank == rank) {
            return Err(PoolError::Communication(format!("rank {rank} connected twice")));
        }
        if size as usize != expected {
            warn!(rank, size, expected, "rank reports a different world size");
        }
        debug!(rank, %peer, "rank connected");
        ranks.push(RankConnection { rank, stream });
    }
    ranks.sort_by_key(|c| c.rank);
    Ok(ranks)
}

fn bootup_error(slot: usize, err: PoolError) -> PoolError {
    match err {
        PoolError::Bootup { .. } => err,
        other => PoolError::Bootup {
            slot,
            reason: other.to_string(),
        },
    }
}

fn link_error(rank: u32, err: PoolError) -> PoolError {
    match err {
        PoolError::Communication(_) => err,
        other => PoolError::Communication(format!("rank {rank}: {other}")),
    }
}
