use crate::raft::RaftNode;
use crate::RpcMessage;
use anyhow::{anyhow, bail, Result};
use log::{debug, error};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Frames larger than this are a protocol error, not a request.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
/// Handler tasks allowed in flight per listener.
const MAX_IN_FLIGHT: usize = 64;

/// Read one length-prefixed JSON frame.
pub async fn read_message(stream: &mut TcpStream) -> Result<RpcMessage> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit", len);
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Write one length-prefixed JSON frame.
pub async fn write_message(stream: &mut TcpStream, message: &RpcMessage) -> Result<()> {
    let bytes = serde_json::to_vec(message)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// One request/response exchange against `addr`, bounded by `deadline`.
/// Transport errors and deadline expiry both surface as `Err`; callers treat
/// either as "no reply from that peer".
pub async fn call(addr: &str, message: &RpcMessage, deadline: Duration) -> Result<RpcMessage> {
    tokio::time::timeout(deadline, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_message(&mut stream, message).await?;
        read_message(&mut stream).await
    })
    .await
    .map_err(|_| anyhow!("rpc to {} timed out", addr))?
}

/// Bind a listener with SO_REUSEADDR so a restarted node can reclaim its
/// old address without waiting out TIME_WAIT.
pub fn bind(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr.parse()?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener)?)
}

/// Accept loop: one frame in, dispatch to the node, at most one frame out.
pub fn serve(listener: TcpListener, node: Arc<RaftNode>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };
            let node = Arc::clone(&node);
            let permits = Arc::clone(&permits);
            tokio::spawn(async move {
                let _permit = match permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let message = match read_message(&mut stream).await {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("dropping malformed frame: {}", e);
                        return;
                    }
                };
                if let Some(response) = node.handle_message(message).await {
                    if let Err(e) = write_message(&mut stream, &response).await {
                        debug!("failed to send response: {}", e);
                    }
                }
            });
        }
    })
}
