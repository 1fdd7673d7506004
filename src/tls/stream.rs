//! Protected application stream produced by a completed handshake.
//!
//! Read side: deframes TLS records from an internal buffer, decrypts, and
//! handles post-handshake messages (NewSessionTicket ignored, KeyUpdate
//! applied, close_notify surfaced as EOF). Write side: frames application
//! data into encrypted records, honoring dynamic record sizing when the
//! profile selected it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::keys::{derive_traffic_key_iv, update_traffic_secret};
use super::record::{
    Tls12GcmCodec, Tls13RecordCodec, CONTENT_TYPE_ALERT, CONTENT_TYPE_APPLICATION_DATA,
    CONTENT_TYPE_CHANGE_CIPHER_SPEC, CONTENT_TYPE_HANDSHAKE, MAX_TLS_CIPHERTEXT_LEN,
    MAX_TLS_PLAINTEXT_LEN, TLS_RECORD_HEADER_LEN,
};

const HANDSHAKE_KEY_UPDATE: u8 = 0x18;

/// Record size cap for the initial flight under dynamic record sizing,
/// roughly one MTU of plaintext; later records grow to the TLS maximum.
const DYNAMIC_RECORD_INITIAL_LEN: usize = 1400;
const DYNAMIC_RECORD_RAMP_COUNT: u64 = 32;

pub(crate) enum StreamProtection {
    Tls13 {
        read: Tls13RecordCodec,
        write: Tls13RecordCodec,
        read_secret: Vec<u8>,
        write_secret: Vec<u8>,
    },
    Tls12 {
        read: Tls12GcmCodec,
        write: Tls12GcmCodec,
    },
}

impl StreamProtection {
    pub(crate) fn tls13(
        read: Tls13RecordCodec,
        write: Tls13RecordCodec,
        read_secret: Vec<u8>,
        write_secret: Vec<u8>,
    ) -> Self {
        StreamProtection::Tls13 {
            read,
            write,
            read_secret,
            write_secret,
        }
    }

    pub(crate) fn tls12(read: Tls12GcmCodec, write: Tls12GcmCodec) -> Self {
        StreamProtection::Tls12 { read, write }
    }
}

pub struct TlsClientStream<S> {
    stream: S,
    protection: StreamProtection,

    /// Raw bytes read from the peer, possibly containing partial records.
    record_buf: Vec<u8>,
    /// Decrypted application data ready for the caller.
    plaintext: Vec<u8>,
    plaintext_pos: usize,
    /// Reassembly buffer for post-handshake handshake messages.
    post_handshake: Vec<u8>,

    /// Encrypted bytes not yet written to the peer.
    write_out: Vec<u8>,
    write_pos: usize,

    records_written: u64,
    dynamic_record_sizing: bool,
    received_close_notify: bool,
    sent_close_notify: bool,
}

impl<S> std::fmt::Debug for TlsClientStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientStream").finish_non_exhaustive()
    }
}

impl<S> TlsClientStream<S> {
    pub(crate) fn new(
        stream: S,
        protection: StreamProtection,
        leftover_handshake: Vec<u8>,
        dynamic_record_sizing: bool,
    ) -> Self {
        Self {
            stream,
            protection,
            record_buf: Vec::new(),
            plaintext: Vec::new(),
            plaintext_pos: 0,
            post_handshake: leftover_handshake,
            write_out: Vec::new(),
            write_pos: 0,
            records_written: 0,
            dynamic_record_sizing,
            received_close_notify: false,
            sent_close_notify: false,
        }
    }

    pub fn negotiated_tls13(&self) -> bool {
        matches!(self.protection, StreamProtection::Tls13 { .. })
    }

    fn max_record_payload(&self) -> usize {
        if self.dynamic_record_sizing && self.records_written < DYNAMIC_RECORD_RAMP_COUNT {
            DYNAMIC_RECORD_INITIAL_LEN
        } else {
            MAX_TLS_PLAINTEXT_LEN
        }
    }

    fn handle_post_handshake_messages(&mut self) -> io::Result<()> {
        loop {
            if self.post_handshake.len() < 4 {
                return Ok(());
            }
            let length = u32::from_be_bytes([
                0,
                self.post_handshake[1],
                self.post_handshake[2],
                self.post_handshake[3],
            ]) as usize;
            if self.post_handshake.len() < 4 + length {
                return Ok(());
            }
            let message: Vec<u8> = self.post_handshake.drain(0..4 + length).collect();
            match message[0] {
                HANDSHAKE_KEY_UPDATE => self.apply_key_update(&message)?,
                // NewSessionTicket and other post-handshake notices carry
                // nothing this stream needs.
                _ => {}
            }
        }
    }

    fn apply_key_update(&mut self, message: &[u8]) -> io::Result<()> {
        let update_requested = message.get(4).copied() == Some(1);
        match &mut self.protection {
            StreamProtection::Tls13 {
                read,
                write,
                read_secret,
                write_secret,
            } => {
                let suite = read.suite();
                *read_secret = update_traffic_secret(suite, read_secret)?;
                let (key, iv) = derive_traffic_key_iv(suite, read_secret)?;
                read.rekey(&key, &iv)?;

                if update_requested {
                    // Acknowledge under the current write keys, then switch.
                    let message = [HANDSHAKE_KEY_UPDATE, 0, 0, 1, 0];
                    let record = write.seal(CONTENT_TYPE_HANDSHAKE, &message)?;
                    self.write_out.extend_from_slice(&record);

                    *write_secret = update_traffic_secret(suite, write_secret)?;
                    let (key, iv) = derive_traffic_key_iv(suite, write_secret)?;
                    write.rekey(&key, &iv)?;
                }
                Ok(())
            }
            StreamProtection::Tls12 { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "key update on a TLS 1.2 stream",
            )),
        }
    }

    /// Process one complete record from record_buf, if present. Returns
    /// true when progress was made.
    fn try_deframe(&mut self) -> io::Result<bool> {
        if self.record_buf.len() < TLS_RECORD_HEADER_LEN {
            return Ok(false);
        }
        let mut header = [0u8; TLS_RECORD_HEADER_LEN];
        header.copy_from_slice(&self.record_buf[0..TLS_RECORD_HEADER_LEN]);
        let record_type = header[0];
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        if length == 0 || length > MAX_TLS_CIPHERTEXT_LEN + 16 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid record length",
            ));
        }
        let total = TLS_RECORD_HEADER_LEN + length;
        if self.record_buf.len() < total {
            return Ok(false);
        }

        let body: Vec<u8> = self
            .record_buf
            .drain(0..total)
            .skip(TLS_RECORD_HEADER_LEN)
            .collect();

        // Decrypt with the protection borrow scoped, then dispatch.
        enum Decoded {
            Plaintext(Vec<u8>),
            PostHandshake(Vec<u8>),
            Alert,
            Nothing,
        }

        let decoded = match &mut self.protection {
            StreamProtection::Tls13 { read, .. } => match record_type {
                CONTENT_TYPE_APPLICATION_DATA => {
                    let (content_type, plaintext) = read.open(&header, &body)?;
                    match content_type {
                        CONTENT_TYPE_APPLICATION_DATA => Decoded::Plaintext(plaintext),
                        CONTENT_TYPE_HANDSHAKE => Decoded::PostHandshake(plaintext),
                        CONTENT_TYPE_ALERT => Decoded::Alert,
                        other => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("unexpected inner record type: {}", other),
                            ));
                        }
                    }
                }
                CONTENT_TYPE_CHANGE_CIPHER_SPEC => Decoded::Nothing,
                CONTENT_TYPE_ALERT => Decoded::Alert,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected record type: {}", other),
                    ));
                }
            },
            StreamProtection::Tls12 { read, .. } => match record_type {
                CONTENT_TYPE_APPLICATION_DATA => {
                    Decoded::Plaintext(read.open(CONTENT_TYPE_APPLICATION_DATA, &body)?)
                }
                CONTENT_TYPE_HANDSHAKE => {
                    // Renegotiation is not supported; drop the payload.
                    let _ = read.open(CONTENT_TYPE_HANDSHAKE, &body)?;
                    Decoded::Nothing
                }
                CONTENT_TYPE_ALERT => Decoded::Alert,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected record type: {}", other),
                    ));
                }
            },
        };

        match decoded {
            Decoded::Plaintext(plaintext) => {
                if self.plaintext_pos == self.plaintext.len() {
                    self.plaintext.clear();
                    self.plaintext_pos = 0;
                }
                self.plaintext.extend_from_slice(&plaintext);
            }
            Decoded::PostHandshake(plaintext) => {
                self.post_handshake.extend_from_slice(&plaintext);
                self.handle_post_handshake_messages()?;
            }
            Decoded::Alert => {
                self.received_close_notify = true;
            }
            Decoded::Nothing => {}
        }
        Ok(true)
    }

    fn seal_application_record(&mut self, payload: &[u8]) -> io::Result<()> {
        let record = match &mut self.protection {
            StreamProtection::Tls13 { write, .. } => {
                write.seal(CONTENT_TYPE_APPLICATION_DATA, payload)?
            }
            StreamProtection::Tls12 { write, .. } => {
                write.seal(CONTENT_TYPE_APPLICATION_DATA, payload)?
            }
        };
        self.write_out.extend_from_slice(&record);
        self.records_written += 1;
        Ok(())
    }

    fn seal_close_notify(&mut self) -> io::Result<()> {
        let alert = [0x01u8, 0x00];
        let record = match &mut self.protection {
            StreamProtection::Tls13 { write, .. } => write.seal(CONTENT_TYPE_ALERT, &alert)?,
            StreamProtection::Tls12 { write, .. } => write.seal(CONTENT_TYPE_ALERT, &alert)?,
        };
        self.write_out.extend_from_slice(&record);
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> TlsClientStream<S> {
    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_out.len() {
            let pending = &self.write_out[self.write_pos..];
            match Pin::new(&mut self.stream).poll_write(cx, pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write record",
                    )));
                }
                Poll::Ready(Ok(written)) => self.write_pos += written,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.write_out.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for TlsClientStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.plaintext_pos < this.plaintext.len() {
                let available = &this.plaintext[this.plaintext_pos..];
                let take = available.len().min(buf.remaining());
                buf.put_slice(&available[0..take]);
                this.plaintext_pos += take;
                return Poll::Ready(Ok(()));
            }
            if this.received_close_notify {
                return Poll::Ready(Ok(()));
            }

            if this.try_deframe()? {
                continue;
            }

            // Need more raw bytes.
            let mut scratch = [0u8; 16 * 1024];
            let mut read_buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut this.stream).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        // EOF without close_notify; surface as EOF, the
                        // tunnel payload carries its own integrity.
                        return Poll::Ready(Ok(()));
                    }
                    this.record_buf.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for TlsClientStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match this.poll_flush_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let take = buf.len().min(this.max_record_payload());
        this.seal_application_record(&buf[0..take])?;
        // The record is buffered; report it written and let flush/the next
        // write drain it.
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.sent_close_notify {
            this.seal_close_notify()?;
            this.sent_close_notify = true;
        }
        match this.poll_flush_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::keys::CipherSuite;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn paired_protection() -> (StreamProtection, StreamProtection) {
        let key_a = [0x31u8; 16];
        let iv_a = [0x32u8; 12];
        let key_b = [0x33u8; 16];
        let iv_b = [0x34u8; 12];
        let suite = CipherSuite::Aes128GcmSha256;
        // Side one writes with (a) and reads with (b); side two mirrors.
        let one = StreamProtection::tls13(
            Tls13RecordCodec::new(suite, &key_b, &iv_b).unwrap(),
            Tls13RecordCodec::new(suite, &key_a, &iv_a).unwrap(),
            vec![0x11; 32],
            vec![0x12; 32],
        );
        let two = StreamProtection::tls13(
            Tls13RecordCodec::new(suite, &key_a, &iv_a).unwrap(),
            Tls13RecordCodec::new(suite, &key_b, &iv_b).unwrap(),
            vec![0x12; 32],
            vec![0x11; 32],
        );
        (one, two)
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_protection, server_protection) = paired_protection();

        let mut client = TlsClientStream::new(client_io, client_protection, Vec::new(), false);
        let mut server = TlsClientStream::new(server_io, server_protection, Vec::new(), false);

        let payload = vec![0x5au8; 40_000];
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_notify_reads_as_eof() {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_protection, server_protection) = paired_protection();

        let mut client = TlsClientStream::new(client_io, client_protection, Vec::new(), false);
        let mut server = TlsClientStream::new(server_io, server_protection, Vec::new(), false);

        client.shutdown().await.unwrap();

        let mut buffer = [0u8; 16];
        let read = server.read(&mut buffer).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_dynamic_record_sizing_caps_first_records() {
        let (client_io, _server_io) = duplex(1024 * 1024);
        let (client_protection, _server_protection) = paired_protection();

        let mut client = TlsClientStream::new(client_io, client_protection, Vec::new(), true);
        let written = client.write(&vec![0u8; 10_000]).await.unwrap();
        assert_eq!(written, DYNAMIC_RECORD_INITIAL_LEN);

        let (client_io2, _server_io2) = duplex(1024 * 1024);
        let (client_protection2, _) = paired_protection();
        let mut fixed = TlsClientStream::new(client_io2, client_protection2, Vec::new(), false);
        let written = fixed.write(&vec![0u8; 10_000]).await.unwrap();
        assert_eq!(written, 10_000);
    }
}
