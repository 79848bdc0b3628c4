//! Message transport over control and work connections

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use rtunnel_proto::{Message, MessageCodec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

/// Any bidirectional byte stream usable as a control or work connection
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Conn for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxConn = Box<dyn Conn>;

/// Write one framed message
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = MessageCodec::encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message; `Ok(None)` on a clean close between frames
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; MessageCodec::HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = MessageCodec::frame_len(&header)?;
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Some(MessageCodec::decode_payload(&payload)?))
}

/// Sends protocol messages over an established control connection
#[async_trait]
pub trait MessageTransporter: Send + Sync {
    async fn send(&self, msg: Message) -> Result<()>;
}

/// Transporter writing frames to the write half of a connection
pub struct FramedTransporter {
    writer: Mutex<Option<WriteHalf<BoxConn>>>,
}

impl FramedTransporter {
    pub fn new(writer: WriteHalf<BoxConn>) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Shut the write half down; later sends fail with `TransportClosed`
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("error shutting down control writer: {}", e);
            }
        }
    }
}

#[async_trait]
impl MessageTransporter for FramedTransporter {
    async fn send(&self, msg: Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::TransportClosed)?;
        write_message(writer, &msg).await
    }
}
