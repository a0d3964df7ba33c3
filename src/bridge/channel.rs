//! Byte-stream adapter between packet channels and the userspace stack
//!
//! The TCP/IP stack wants one object that is both `AsyncRead` and
//! `AsyncWrite`. `StackChannel` maps an mpsc pair onto that interface so
//! ingress packets feed the stack's read side and packets the stack emits
//! come back out of the paired receiver. The two directions are sized
//! independently; ingress absorbs host write bursts while egress only needs
//! to cover the delivery slot's draining latency.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

pub struct StackChannel {
    /// Ingress packets destined for the stack
    ingress: mpsc::Receiver<BytesMut>,
    /// Egress packets produced by the stack
    egress: PollSender<BytesMut>,
    /// Unread tail of a packet that did not fit the caller's buffer
    pending: BytesMut,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stack endpoint closed")
}

impl StackChannel {
    pub fn new(ingress: mpsc::Receiver<BytesMut>, egress: mpsc::Sender<BytesMut>) -> Self {
        Self {
            ingress,
            egress: PollSender::new(egress),
            pending: BytesMut::new(),
        }
    }

    /// Create a channel plus its two packet-side endpoints
    ///
    /// The returned sender injects IP packets into the stack; the receiver
    /// yields IP packets the stack wants sent back toward the host.
    pub fn create_pair(
        ingress_capacity: usize,
        egress_capacity: usize,
    ) -> (Self, mpsc::Sender<BytesMut>, mpsc::Receiver<BytesMut>) {
        let (in_tx, in_rx) = mpsc::channel(ingress_capacity);
        let (out_tx, out_rx) = mpsc::channel(egress_capacity);
        (Self::new(in_rx, out_tx), in_tx, out_rx)
    }
}

impl AsyncRead for StackChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // A packet larger than the caller's buffer is handed out in slices;
        // the stack must never see a truncated packet spliced onto the next.
        if this.pending.is_empty() {
            match ready!(this.ingress.poll_recv(cx)) {
                Some(packet) => this.pending = packet,
                // Closed channel reads as EOF.
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for StackChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if ready!(this.egress.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(closed()));
        }
        match this.egress.send_item(BytesMut::from(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Closing egress lets the router task drain out instead of hanging
        // on a receiver that will never yield again.
        self.get_mut().egress.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn read_side_delivers_injected_packets() {
        let (mut channel, tx, _rx) = StackChannel::create_pair(16, 16);

        tx.send(BytesMut::from(&b"hello world"[..])).await.unwrap();

        let mut buf = [0u8; 32];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[tokio::test]
    async fn oversized_packet_survives_partial_reads() {
        let (mut channel, tx, _rx) = StackChannel::create_pair(16, 16);

        tx.send(BytesMut::from(&b"0123456789"[..])).await.unwrap();

        let mut buf = [0u8; 4];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"0123");
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"4567");
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"89");
    }

    #[tokio::test]
    async fn write_side_emits_whole_packets() {
        let (mut channel, _tx, mut rx) = StackChannel::create_pair(16, 16);

        channel.write_all(b"packet-one").await.unwrap();
        let out = rx.recv().await.unwrap();
        assert_eq!(&out[..], b"packet-one");
    }

    #[tokio::test]
    async fn shutdown_closes_the_egress_side() {
        let (mut channel, _tx, mut rx) = StackChannel::create_pair(16, 2);

        channel.write_all(b"last").await.unwrap();
        channel.shutdown().await.unwrap();

        assert_eq!(&rx.recv().await.unwrap()[..], b"last");
        assert!(rx.recv().await.is_none());
        assert!(channel.write_all(b"late").await.is_err());
    }
}
