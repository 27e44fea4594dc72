//! Shared framing and raw-body transfer for both the client and the server
//!
//! Control messages travel as `[u32 LE length][message bytes]`. File bodies
//! travel raw, right after the control message that declared their length, in
//! `CHUNK_SIZE` pieces. Every socket operation runs under a deadline.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::error::{FtpError, Result};
use crate::protocol::timeouts::Timeouts;
use crate::protocol::{Message, CHUNK_SIZE, LEN_PREFIX_SIZE, MAX_FRAME_SIZE};

/// Validate a control message size against MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(FtpError::Framing(format!(
            "frame too large: {} bytes (max: {} bytes)",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

pub fn build_frame_header(payload_len: u32) -> [u8; LEN_PREFIX_SIZE] {
    payload_len.to_le_bytes()
}

pub fn parse_frame_header(header: &[u8; LEN_PREFIX_SIZE]) -> Result<usize> {
    let len = u32::from_le_bytes(*header) as usize;
    validate_frame_size(len)?;
    Ok(len)
}

/// Length prefix plus serialized message, ready for a single write.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>> {
    let len = msg.encoded_len();
    validate_frame_size(len)?;
    let mut buf = Vec::with_capacity(LEN_PREFIX_SIZE + len);
    buf.extend_from_slice(&build_frame_header(len as u32));
    buf.extend_from_slice(&msg.serialize());
    Ok(buf)
}

#[inline]
async fn read_exact_timed<R>(stream: &mut R, buf: &mut [u8], ms: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match timeout(Duration::from_millis(ms), stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(FtpError::connection(e)),
        Err(_) => Err(FtpError::Connection(format!("read timeout ({} ms)", ms))),
    }
}

#[inline]
async fn read_some_timed<R>(stream: &mut R, buf: &mut [u8], ms: u64) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    match timeout(Duration::from_millis(ms), stream.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(FtpError::connection(e)),
        Err(_) => Err(FtpError::Connection(format!("read timeout ({} ms)", ms))),
    }
}

#[inline]
async fn write_all_timed<W>(stream: &mut W, buf: &[u8], ms: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(Duration::from_millis(ms), async {
        stream.write_all(buf).await?;
        stream.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FtpError::connection(e)),
        Err(_) => Err(FtpError::Connection(format!("write timeout ({} ms)", ms))),
    }
}

/// Send one control message. Both the prefix and the payload must be written
/// in full or the call fails with `Connection`.
pub async fn send_framed<W>(stream: &mut W, msg: &Message, timeouts: &Timeouts) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    let ms = timeouts.frame_deadline_ms(frame.len());
    write_all_timed(stream, &frame, ms).await
}

/// Receive one control message.
///
/// `header_ms` bounds the wait for the length prefix (the server passes its
/// idle timeout here). EOF before the prefix is `Disconnected`; any other short
/// read is `Connection`. Never retried: a half-read frame cannot be recovered.
pub async fn receive_framed<R>(stream: &mut R, header_ms: u64, timeouts: &Timeouts) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_PREFIX_SIZE];
    match timeout(Duration::from_millis(header_ms), stream.read_exact(&mut header)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FtpError::Disconnected)
        }
        Ok(Err(e)) => return Err(FtpError::connection(e)),
        Err(_) => {
            return Err(FtpError::Connection(format!(
                "frame header timeout ({} ms)",
                header_ms
            )))
        }
    }
    let len = parse_frame_header(&header)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        read_exact_timed(stream, &mut payload, timeouts.frame_deadline_ms(len)).await?;
    }
    Message::deserialize(&payload)
}

/// Stream exactly `len` bytes from a local source onto the connection.
///
/// `on_progress` receives the running byte count after every chunk. A source
/// that ends early fails with `Io`; the connection is desynchronized at that
/// point and the caller must drop it.
pub async fn send_raw_body<R, W, F>(
    src: &mut R,
    stream: &mut W,
    len: u64,
    timeouts: &Timeouts,
    mut on_progress: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        let n = src.read(&mut buf[..to_read]).await?;
        if n == 0 {
            return Err(FtpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended {} bytes short of declared size", remaining),
            )));
        }
        write_all_timed(stream, &buf[..n], timeouts.io_ms).await?;
        remaining -= n as u64;
        on_progress(len - remaining);
    }
    Ok(())
}

/// Read exactly `len` raw bytes off the connection into `dst`.
///
/// A short or failed socket read is `Connection`. A failed local write does not
/// stop the transfer: the rest of the body is drained so the connection stays
/// in sync, and the write error is returned as `Io` afterwards.
pub async fn recv_raw_body<R, W, F>(
    stream: &mut R,
    dst: &mut W,
    len: u64,
    timeouts: &Timeouts,
    mut on_progress: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = len;
    let mut write_err: Option<std::io::Error> = None;
    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        let n = read_some_timed(stream, &mut buf[..to_read], timeouts.io_ms).await?;
        if n == 0 {
            return Err(FtpError::Connection(format!(
                "unexpected EOF with {} bytes of raw body outstanding",
                remaining
            )));
        }
        if write_err.is_none() {
            if let Err(e) = dst.write_all(&buf[..n]).await {
                write_err = Some(e);
            }
        }
        remaining -= n as u64;
        on_progress(len - remaining);
    }
    if write_err.is_none() {
        if let Err(e) = dst.flush().await {
            write_err = Some(e);
        }
    }
    match write_err {
        Some(e) => Err(FtpError::Io(e)),
        None => Ok(()),
    }
}

/// Consume and discard a raw body the receiver does not want.
pub async fn drain_raw_body<R>(stream: &mut R, len: u64, timeouts: &Timeouts) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    recv_raw_body(stream, &mut tokio::io::sink(), len, timeouts, |_| {}).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn quick() -> Timeouts {
        Timeouts {
            idle_ms: 1_000,
            io_ms: 1_000,
            connect_ms: 1_000,
        }
    }

    struct BrokenDisk;

    impl AsyncWrite for BrokenDisk {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_encode_frame_prefix_matches_payload() {
        let msg = Message::new(Command::Cd, "/sub");
        let frame = encode_frame(&msg).unwrap();
        let mut header = [0u8; LEN_PREFIX_SIZE];
        header.copy_from_slice(&frame[..LEN_PREFIX_SIZE]);
        assert_eq!(parse_frame_header(&header).unwrap(), frame.len() - LEN_PREFIX_SIZE);
        assert_eq!(&frame[LEN_PREFIX_SIZE..], msg.serialize().as_slice());
    }

    #[test]
    fn test_validate_frame_size() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
    }

    #[tokio::test]
    async fn test_framed_exchange() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let t = quick();
        let sent = vec![
            Message::new(Command::List, ""),
            Message::new(Command::Download, "file.bin").with_data_size(8193),
            Message::error(Command::Cd, "Path does not exist"),
        ];
        for msg in &sent {
            send_framed(&mut a, msg, &t).await.unwrap();
        }
        for msg in &sent {
            assert_eq!(&receive_framed(&mut b, t.idle_ms, &t).await.unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn test_clean_close_is_disconnected() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let t = quick();
        assert!(matches!(
            receive_framed(&mut b, t.idle_ms, &t).await,
            Err(FtpError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_is_connection_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = encode_frame(&Message::new(Command::Cd, "/somewhere")).unwrap();
        a.write_all(&frame[..frame.len() - 3]).await.unwrap();
        drop(a);
        let t = quick();
        assert!(matches!(
            receive_framed(&mut b, t.idle_ms, &t).await,
            Err(FtpError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_prefix_is_framing_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&((MAX_FRAME_SIZE + 1) as u32).to_le_bytes())
            .await
            .unwrap();
        let t = quick();
        assert!(matches!(
            receive_framed(&mut b, t.idle_ms, &t).await,
            Err(FtpError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (_a, mut b) = tokio::io::duplex(1024);
        let t = quick();
        assert!(matches!(
            receive_framed(&mut b, 50, &t).await,
            Err(FtpError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_raw_body_round_trip() {
        let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let (mut a, mut b) = tokio::io::duplex(4096);
        let t = quick();
        let len = body.len() as u64;

        let src = body.clone();
        let writer = tokio::spawn(async move {
            let mut reader = &src[..];
            send_raw_body(&mut reader, &mut a, len, &quick(), |_| {}).await
        });

        let mut out = Vec::new();
        let mut last = 0;
        recv_raw_body(&mut b, &mut out, len, &t, |n| last = n).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(out, body);
        assert_eq!(last, len);
    }

    #[tokio::test]
    async fn test_short_source_fails_send() {
        let (mut a, _b) = tokio::io::duplex(64 * 1024);
        let mut reader = &b"abc"[..];
        let res = send_raw_body(&mut reader, &mut a, 10, &quick(), |_| {}).await;
        assert!(matches!(res, Err(FtpError::Io(_))));
    }

    #[tokio::test]
    async fn test_short_body_is_connection_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[1u8; 100]).await.unwrap();
        drop(a);
        let mut out = Vec::new();
        let res = recv_raw_body(&mut b, &mut out, 200, &quick(), |_| {}).await;
        assert!(matches!(res, Err(FtpError::Connection(_))));
    }

    #[tokio::test]
    async fn test_write_failure_still_drains_body() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let t = quick();
        a.write_all(&[7u8; 10_000]).await.unwrap();
        send_framed(&mut a, &Message::new(Command::Pwd, ""), &t).await.unwrap();

        let res = recv_raw_body(&mut b, &mut BrokenDisk, 10_000, &t, |_| {}).await;
        assert!(matches!(res, Err(FtpError::Io(_))));
        // The next control message is still readable
        let next = receive_framed(&mut b, t.idle_ms, &t).await.unwrap();
        assert_eq!(next.command, Command::Pwd);
    }

    #[tokio::test]
    async fn test_drain_skips_exact_length() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let t = quick();
        a.write_all(&[0u8; 8193]).await.unwrap();
        send_framed(&mut a, &Message::new(Command::List, ""), &t).await.unwrap();
        drain_raw_body(&mut b, 8193, &t).await.unwrap();
        assert_eq!(
            receive_framed(&mut b, t.idle_ms, &t).await.unwrap().command,
            Command::List
        );
    }
}
