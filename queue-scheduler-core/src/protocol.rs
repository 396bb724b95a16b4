//! Wire protocol spoken between the scheduler and the brokers.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON body. A broker
//! opens the connection with [`Frame::Open`], the scheduler answers with
//! [`Frame::OpenOk`] and from then on drives the broker with correlated
//! [`Frame::Request`] / [`Frame::Response`] pairs until either side sends
//! [`Frame::Close`] or drops the transport.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::errors::{Result, SchedulerError};

/// Connection property carrying the group a broker belongs to.
pub const GROUP_ID_PROPERTY: &str = "qd.route-container-group";

/// Connection property carrying an authentication secret.
pub const AUTHORIZATION_PROPERTY: &str = "authorization";

/// Container id the scheduler announces in its `OpenOk` frame.
pub const SCHEDULER_CONTAINER_ID: &str = "queue-scheduler";

pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Self-declared identity of the broker process.
    pub container_id: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl OpenRequest {
    pub fn new(container_id: impl Into<String>) -> Self {
        OpenRequest {
            container_id: container_id.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Group announced through the group property, falling back to the container id.
    pub fn group_id(&self) -> &str {
        self.properties
            .get(GROUP_ID_PROPERTY)
            .map(String::as_str)
            .unwrap_or(&self.container_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerCommand {
    ListQueues,
    CreateQueue { address: Address },
    DeleteQueue { address: Address },
}

impl BrokerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerCommand::ListQueues => "list_queues",
            BrokerCommand::CreateQueue { .. } => "create_queue",
            BrokerCommand::DeleteQueue { .. } => "delete_queue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Queues { names: Vec<String> },
    Done,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Open(OpenRequest),
    OpenOk {
        container_id: String,
    },
    Request {
        id: u64,
        command: BrokerCommand,
    },
    Response {
        id: u64,
        outcome: CommandOutcome,
    },
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Reads the next frame. Returns `Ok(None)` when the peer closed the stream
/// on a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let read = reader.read(&mut prefix[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "stream closed inside a frame length prefix",
            )
            .into());
        }
        filled += read;
    }

    let len = u32::from_be_bytes(prefix) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(SchedulerError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Some(serde_json::from_slice(&body)?))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(SchedulerError::FrameTooLarge(body.len()));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
