//! TCP transport to the game server
//!
//! The server greets with its protocol name, then both sides exchange
//! length-prefixed frames. Replies carry the handle of the call they answer.
//! A reader task forwards every incoming frame in arrival order and a writer
//! task sends outgoing ones. Callbacks that arrive while a reply is awaited
//! are buffered until the next poll.
//!
//! Waiting for a reply blocks the calling thread through
//! [`tokio::task::block_in_place`], so the session needs the multi-threaded
//! runtime.

use crate::rpc::{Callback, QueryError, RpcSession, TransportError};
use log::{debug, error, info, warn};
use shared::{
    decode_multicall, encode_frame, encode_multicall, parse_frame_header, Fault, Message, RpcValue,
    FRAME_HEADER_LEN, MAX_GREETING_LEN, MULTICALL_METHOD, PROTOCOL_NAME,
};
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

/// Handles of our calls have the high bit set
const HANDLE_BASE: u32 = 0x8000_0000;

/// Frame or failure forwarded by the reader task
type Inbound = Result<(u32, Message), TransportError>;

pub struct TcpSession {
    runtime: Handle,
    reply_timeout: Duration,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
    handle: u32,
    staged: Vec<(String, Vec<RpcValue>)>,
    callbacks: VecDeque<Callback>,
    last_error: Option<Fault>,
}

impl TcpSession {
    /// Connects and completes the greeting
    ///
    /// `wait` bounds the connect, the greeting and every later reply.
    pub async fn connect(address: &str, wait: Duration) -> Result<Self, TransportError> {
        info!(
            "Try to connect to dedicated server on {} timeout {}s",
            address,
            wait.as_secs()
        );
        let stream = timeout(wait, TcpStream::connect(address))
            .await
            .map_err(|_| {
                io::Error::new(ErrorKind::TimedOut, format!("no answer from {}", address))
            })??;
        stream.set_nodelay(true)?;
        Self::from_stream(stream, wait).await
    }

    /// Completes the greeting on an already connected stream
    pub async fn from_stream(stream: TcpStream, wait: Duration) -> Result<Self, TransportError> {
        let (mut reader, writer) = stream.into_split();

        let protocol = timeout(wait, read_greeting(&mut reader))
            .await
            .map_err(|_| TransportError::Timeout {
                method: "greeting".to_string(),
                timeout: wait,
            })??;
        if protocol != PROTOCOL_NAME {
            return Err(TransportError::Handshake(protocol));
        }
        debug!("Server speaks {}", protocol);

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(receive_frames(reader, inbound_tx)),
            tokio::spawn(send_frames(writer, outbound_rx)),
        ];

        Ok(Self {
            runtime: Handle::current(),
            reply_timeout: wait,
            inbound,
            outbound,
            tasks,
            handle: HANDLE_BASE,
            staged: Vec::new(),
            callbacks: VecDeque::new(),
            last_error: None,
        })
    }

    fn next_handle(&mut self) -> u32 {
        self.handle = self.handle.wrapping_add(1) | HANDLE_BASE;
        self.handle
    }

    fn buffer(&mut self, (handle, message): (u32, Message)) {
        match message {
            Message::Callback { method, params } => {
                self.callbacks.push_back(Callback::new(method, params));
            }
            Message::Reply(_) => warn!("Discarding reply for unknown handle {:#x}", handle),
            Message::Call { method, .. } => warn!("Ignoring call {} sent by the server", method),
        }
    }

    /// Sends a call and waits for its reply, buffering callbacks
    fn call(
        &mut self,
        method: &str,
        params: Vec<RpcValue>,
    ) -> Result<Result<RpcValue, Fault>, TransportError> {
        let handle = self.next_handle();
        let frame = encode_frame(
            handle,
            &Message::Call {
                method: method.to_string(),
                params,
            },
        )?;
        self.outbound.send(frame).map_err(|_| TransportError::Closed)?;

        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let runtime = &self.runtime;
            let inbound = &mut self.inbound;
            let received = tokio::task::block_in_place(|| {
                runtime.block_on(timeout_at(deadline, inbound.recv()))
            });

            let frame = match received {
                Ok(Some(frame)) => frame?,
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => {
                    return Err(TransportError::Timeout {
                        method: method.to_string(),
                        timeout: self.reply_timeout,
                    })
                }
            };
            match frame {
                (reply_handle, Message::Reply(outcome)) if reply_handle == handle => {
                    return Ok(outcome);
                }
                other => self.buffer(other),
            }
        }
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl RpcSession for TcpSession {
    fn query(&mut self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue, QueryError> {
        match self.call(method, params)? {
            Ok(value) => {
                self.last_error = None;
                Ok(value)
            }
            Err(fault) => {
                self.last_error = Some(fault.clone());
                Err(QueryError::Fault(fault))
            }
        }
    }

    fn stage_batched(&mut self, method: &str, params: Vec<RpcValue>) -> usize {
        self.staged.push((method.to_string(), params));
        self.staged.len() - 1
    }

    fn flush_batch(&mut self) -> Result<Vec<Result<RpcValue, Fault>>, TransportError> {
        let calls = std::mem::take(&mut self.staged);
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let reply = self
            .call(MULTICALL_METHOD, vec![encode_multicall(&calls)])?
            .map_err(|fault| TransportError::MalformedBatch(format!("multicall refused: {}", fault)))?;

        let outcomes = decode_multicall(&reply).ok_or_else(|| {
            TransportError::MalformedBatch("reply is not a list of results".to_string())
        })?;
        if outcomes.len() != calls.len() {
            return Err(TransportError::MalformedBatch(format!(
                "{} results for {} calls",
                outcomes.len(),
                calls.len()
            )));
        }
        Ok(outcomes)
    }

    fn poll_callbacks(&mut self) -> Result<Vec<Callback>, TransportError> {
        loop {
            match self.inbound.try_recv() {
                Ok(frame) => {
                    let frame = frame?;
                    self.buffer(frame);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(TransportError::Closed),
            }
        }
        Ok(self.callbacks.drain(..).collect())
    }

    fn last_error(&self) -> Option<&Fault> {
        self.last_error.as_ref()
    }
}

async fn read_greeting(reader: &mut OwnedReadHalf) -> io::Result<String> {
    let len = reader.read_u32_le().await?;
    if len > MAX_GREETING_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("greeting of {} bytes", len),
        ));
    }
    let mut name = vec![0u8; len as usize];
    reader.read_exact(&mut name).await?;
    Ok(String::from_utf8_lossy(&name).into_owned())
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Inbound {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(closed_or_io)?;
    let (len, handle) = parse_frame_header(header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    let message = bincode::deserialize(&payload)?;
    Ok((handle, message))
}

fn closed_or_io(e: io::Error) -> TransportError {
    if e.kind() == ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

/// Forwards frames until the connection fails, then forwards the failure
async fn receive_frames(mut reader: OwnedReadHalf, inbound: mpsc::UnboundedSender<Inbound>) {
    loop {
        let frame = read_frame(&mut reader).await;
        let failed = frame.is_err();
        if inbound.send(frame).is_err() || failed {
            break;
        }
    }
}

async fn send_frames(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            error!("Failed to send frame to server: {}", e);
            break;
        }
    }
}
