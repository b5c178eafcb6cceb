//! Terminator based message framing, plus the ONC RPC record marking used
//! on length-prefixed streams.

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};

use crate::{
    config::{DEFAULT_READ_TERMINATOR, DEFAULT_WRITE_TERMINATOR},
    error::{Error, Result},
    transport::{READ_CHUNK, Transport},
};

/// Send and receive terminators. Either may be empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Terminators {
    pub send: Vec<u8>,
    pub recv: Vec<u8>,
}
impl Terminators {
    pub fn new(send: impl AsRef<[u8]>, recv: impl AsRef<[u8]>) -> Self {
        Self {
            send: send.as_ref().to_vec(),
            recv: recv.as_ref().to_vec(),
        }
    }

    pub fn none() -> Self {
        Self::new([], [])
    }
}
impl Default for Terminators {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TERMINATOR, DEFAULT_READ_TERMINATOR)
    }
}

/// Append the send terminator to a payload
pub fn frame(payload: &[u8], terminator: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + terminator.len());
    out.extend_from_slice(payload);
    out.extend_from_slice(terminator);
    out
}

/// Bytes received but not yet handed out as a message. Anything read past a
/// terminator stays here for the next receive.
#[derive(Debug, Default)]
pub struct RxBuffer {
    buf: Vec<u8>,
    /// Offset up to which the buffer is known not to contain a terminator
    scanned: usize,
}
impl RxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Remove and return the first `len` bytes
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.buf.len());
        self.scanned = 0;
        self.buf.drain(..len).collect()
    }

    pub fn take_all(&mut self) -> Vec<u8> {
        self.scanned = 0;
        std::mem::take(&mut self.buf)
    }

    /// Remove and return the bytes before the first `terminator`, dropping the
    /// terminator itself
    pub fn take_message(&mut self, terminator: &[u8]) -> Option<Vec<u8>> {
        if terminator.is_empty() || self.buf.len() < terminator.len() {
            return None;
        }

        /* A terminator may straddle the previously scanned edge */
        let start = self.scanned.saturating_sub(terminator.len() - 1);
        match self.buf[start..]
            .windows(terminator.len())
            .position(|w| w == terminator)
        {
            Some(pos) => {
                let end = start + pos;
                let msg = self.buf[..end].to_vec();
                self.buf.drain(..end + terminator.len());
                self.scanned = 0;
                Some(msg)
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// Drop consecutive terminators at the head of the buffer
    pub fn skip_leading(&mut self, terminator: &[u8]) {
        if terminator.is_empty() {
            return;
        }
        while self.buf.starts_with(terminator) {
            self.buf.drain(..terminator.len());
            self.scanned = 0;
        }
    }
}

/// Receive one message from `transport`.
///
/// With a non-empty `terminator` bytes are consumed until it is matched. With
/// an empty terminator, `expected_len` bytes are read if given, otherwise a
/// single backend read is returned.
pub async fn deframe<T: Transport + ?Sized>(
    transport: &mut T,
    buffer: &mut RxBuffer,
    terminator: &[u8],
    expected_len: Option<usize>,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;

    if !terminator.is_empty() {
        loop {
            if let Some(msg) = buffer.take_message(terminator) {
                buffer.skip_leading(terminator);
                return Ok(msg);
            }
            fill(transport, buffer, deadline, timeout).await?;
        }
    }

    match expected_len {
        Some(len) => {
            while buffer.len() < len {
                fill(transport, buffer, deadline, timeout).await?;
            }
            Ok(buffer.take(len))
        }
        None => {
            if buffer.is_empty() {
                fill(transport, buffer, deadline, timeout).await?;
            }
            Ok(buffer.take_all())
        }
    }
}

/// One backend read into the buffer, bounded by `deadline`. On timeout the
/// buffered bytes are drained into the error.
async fn fill<T: Transport + ?Sized>(
    transport: &mut T,
    buffer: &mut RxBuffer,
    deadline: Instant,
    timeout: Duration,
) -> Result<()> {
    let timed_out = |buffer: &mut RxBuffer| Error::ReceiveTimeout {
        timeout,
        partial: buffer.take_all(),
    };

    if Instant::now() >= deadline {
        return Err(timed_out(buffer));
    }

    match tokio::time::timeout_at(deadline, transport.read(READ_CHUNK)).await {
        Err(_) => Err(timed_out(buffer)),
        Ok(Err(Error::ReceiveTimeout { .. })) => Err(timed_out(buffer)),
        Ok(Err(e)) => Err(e),
        Ok(Ok(data)) if data.is_empty() => {
            let lost = buffer.take_all();
            Err(Error::Read(format!(
                "End of stream with {} bytes of incomplete message",
                lost.len()
            )))
        }
        Ok(Ok(data)) => {
            buffer.put(&data);
            Ok(())
        }
    }
}

/// Marks the final fragment of a record
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Largest record accepted from a peer
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Write `payload` as a single record fragment
pub async fn write_record<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| len & LAST_FRAGMENT == 0)
        .ok_or_else(|| Error::Write(format!("Record of {} bytes is too large", payload.len())))?;

    let mut packet = Vec::with_capacity(payload.len() + 4);
    packet.extend_from_slice(&(len | LAST_FRAGMENT).to_be_bytes());
    packet.extend_from_slice(payload);
    stream.write_all(&packet).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one record, joining fragments. `Ok(None)` on a clean end of stream
/// before the first header.
pub async fn read_record<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>> {
    let mut record = vec![];
    loop {
        let header = match stream.read_u32().await {
            Ok(header) => header,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && record.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let size = (header & !LAST_FRAGMENT) as usize;
        if record.len() + size > max_len {
            return Err(Error::BadResponse(format!(
                "Record of {} bytes exceeds limit of {max_len}",
                record.len() + size
            )));
        }

        let start = record.len();
        record.resize(start + size, 0);
        stream.read_exact(&mut record[start..]).await?;

        if header & LAST_FRAGMENT != 0 {
            return Ok(Some(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    const SHORT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn deframe_inverts_frame() {
        let terms: [&[u8]; 3] = [b"\n", b"\r\n", b"END"];
        for term in terms {
            let payload = b"MEAS:VOLT? 1.234,5.678";
            let (mut mock, handle) = MockTransport::new();
            handle.push_read(frame(payload, term));

            let mut buffer = RxBuffer::new();
            let msg = deframe(&mut mock, &mut buffer, term, None, SHORT)
                .await
                .unwrap();
            assert_eq!(msg, payload);
            assert!(buffer.is_empty());
        }
    }

    #[tokio::test]
    async fn terminator_split_across_reads() {
        let (mut mock, handle) = MockTransport::new();
        handle.push_read(b"+1.0000E");
        handle.push_read(b"+00\r");
        handle.push_read(b"\nNEXT\r\n");

        let mut buffer = RxBuffer::new();
        let first = deframe(&mut mock, &mut buffer, b"\r\n", None, SHORT)
            .await
            .unwrap();
        assert_eq!(first, b"+1.0000E+00");

        /* Bytes past the first terminator are kept for the next message */
        assert_eq!(buffer.len(), 6);
        let second = deframe(&mut mock, &mut buffer, b"\r\n", None, SHORT)
            .await
            .unwrap();
        assert_eq!(second, b"NEXT");
    }

    #[tokio::test]
    async fn repeated_terminators_are_skipped() {
        let (mut mock, handle) = MockTransport::new();
        handle.push_read(b"A\n\n\nB\n");

        let mut buffer = RxBuffer::new();
        let a = deframe(&mut mock, &mut buffer, b"\n", None, SHORT).await.unwrap();
        let b = deframe(&mut mock, &mut buffer, b"\n", None, SHORT).await.unwrap();
        assert_eq!((a, b), (b"A".to_vec(), b"B".to_vec()));
    }

    #[tokio::test]
    async fn timeout_carries_partial_data() {
        let (mut mock, handle) = MockTransport::new();
        handle.push_read(b"CURVE 1,2,3");

        let mut buffer = RxBuffer::new();
        let err = deframe(&mut mock, &mut buffer, b"\n", None, SHORT)
            .await
            .unwrap_err();
        match err {
            Error::ReceiveTimeout { partial, timeout } => {
                assert_eq!(partial, b"CURVE 1,2,3");
                assert_eq!(timeout, SHORT);
            }
            e => panic!("unexpected error {e}"),
        }
        /* Partial data is not left behind for the next receive */
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn empty_terminator_uses_length_or_single_read() {
        let (mut mock, handle) = MockTransport::new();
        handle.push_read(b"#2");
        handle.push_read(b"10ABCDEFGHIJ");

        let mut buffer = RxBuffer::new();
        let header = deframe(&mut mock, &mut buffer, b"", Some(4), SHORT)
            .await
            .unwrap();
        assert_eq!(header, b"#210");

        let rest = deframe(&mut mock, &mut buffer, b"", None, SHORT).await.unwrap();
        assert_eq!(rest, b"ABCDEFGHIJ");
    }

    #[test]
    fn take_message_handles_straddling_terminator() {
        let mut buffer = RxBuffer::new();
        buffer.put(b"abc\r");
        assert_eq!(buffer.take_message(b"\r\n"), None);
        buffer.put(b"\ndef");
        assert_eq!(buffer.take_message(b"\r\n"), Some(b"abc".to_vec()));
        assert_eq!(buffer.take_all(), b"def");
    }

    #[tokio::test]
    async fn record_marking_joins_fragments() {
        let mut wire = vec![];
        wire.extend_from_slice(&3u32.to_be_bytes());
        wire.extend_from_slice(b"abc");
        wire.extend_from_slice(&(2 | LAST_FRAGMENT).to_be_bytes());
        wire.extend_from_slice(b"de");

        let mut reader = wire.as_slice();
        let record = read_record(&mut reader, 64).await.unwrap();
        assert_eq!(record, Some(b"abcde".to_vec()));
        assert_eq!(read_record(&mut reader, 64).await.unwrap(), None);

        let mut out = vec![];
        write_record(&mut out, b"xyz").await.unwrap();
        assert_eq!(&out[..4], &(3 | LAST_FRAGMENT).to_be_bytes());

        let mut reader = out.as_slice();
        assert!(read_record(&mut reader, 2).await.is_err());
    }
}
