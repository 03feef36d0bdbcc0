//! Unix socket serving. One JSON document per line in each direction.

use std::sync::Arc;

use anyhow::Result;
use appgate_protocol::{ProtocolError, ResponseFrame, ValidationIssue};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, warn};

use crate::gateway::{unreadable_line, Gateway};

pub async fn serve(listener: UnixListener, gateway: Arc<Gateway>) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let gateway = gateway.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, gateway).await {
                error!("Connection error: {}", e);
            }
        });
    }
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let response_line = serde_json::to_string(value)? + "\n";
    writer.write_all(response_line.as_bytes()).await?;
    Ok(())
}

#[derive(Debug)]
enum Frame {
    Line(String),
    NotUtf8(String),
    Oversized,
    Eof,
}

/// Reads one newline-terminated frame, never buffering more than
/// `max_bytes + 1` bytes of it.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max_bytes: usize) -> Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = u64::try_from(max_bytes)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > max_bytes {
        return Ok(Frame::Oversized);
    }
    Ok(match std::str::from_utf8(buf) {
        Ok(line) => Frame::Line(line.trim().to_string()),
        Err(err) => Frame::NotUtf8(err.to_string()),
    })
}

fn oversized(max_bytes: usize) -> ResponseFrame {
    ResponseFrame::err(
        None,
        &ProtocolError::bad_request(format!("request line exceeds {max_bytes} bytes")),
    )
}

pub async fn handle_connection(stream: UnixStream, gateway: Arc<Gateway>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let max_bytes = gateway.max_frame_bytes();

    let caller = loop {
        match read_frame(&mut buf_reader, &mut buf, max_bytes).await? {
            Frame::Eof => return Ok(()),
            Frame::Oversized => {
                warn!(max_bytes, "oversized connect request; closing");
                write_line(&mut writer, &oversized(max_bytes)).await?;
                return Ok(());
            }
            Frame::NotUtf8(detail) => {
                let err = ProtocolError::validation(
                    "malformed connect request",
                    vec![ValidationIssue::new("$", detail)],
                );
                write_line(&mut writer, &ResponseFrame::err(None, &err)).await?;
                return Ok(());
            }
            Frame::Line(raw) => {
                if raw.is_empty() {
                    continue;
                }
                match gateway.accept(&raw).await {
                    Ok((caller, response)) => {
                        write_line(&mut writer, &response).await?;
                        break caller;
                    }
                    Err(err) => {
                        write_line(&mut writer, &ResponseFrame::err(None, &err)).await?;
                        return Ok(());
                    }
                }
            }
        }
    };

    loop {
        match read_frame(&mut buf_reader, &mut buf, max_bytes).await? {
            Frame::Eof => break,
            Frame::Oversized => {
                warn!(handler_id = %caller.handler_id(), max_bytes, "oversized request; closing");
                write_line(&mut writer, &oversized(max_bytes)).await?;
                return Ok(());
            }
            Frame::NotUtf8(detail) => {
                debug!(handler_id = %caller.handler_id(), "request line is not UTF-8");
                write_line(&mut writer, &unreadable_line(detail)).await?;
            }
            Frame::Line(raw) => {
                if raw.is_empty() {
                    continue;
                }
                let response = gateway.handle_line(&caller, &raw).await;
                write_line(&mut writer, &response).await?;
            }
        }
    }
    debug!(handler_id = %caller.handler_id(), "app disconnected");
    Ok(())
}
