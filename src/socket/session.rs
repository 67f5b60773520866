use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::AsyncWriteExt,
    sync::mpsc,
    time::{Interval, MissedTickBehavior},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use super::{Io, Signal, SocketOptions};
use crate::{
    codec::MessageCodec,
    error::{CodecError, DisconnectReason},
    message::{Identity, Message, Tag},
};

/// The queue a session drains, shared with the [`Socket`](super::Socket) that fills it.
pub(super) struct Outgoing {
    pub(super) rx: mpsc::UnboundedReceiver<Message>,
    pub(super) queued: Arc<AtomicUsize>,
}

impl Outgoing {
    fn written(&self, len: usize) {
        self.queued.fetch_sub(len, Ordering::Relaxed);
    }
}

/// Runs one transport session until either side closes it, returning why it ended.
///
/// Reading and writing progress independently so that a peer which stops reading can never stall delivery of
/// its own incoming frames. Heartbeats are sent every interval and any inbound frame counts as liveness.
pub(super) async fn run(
    stream: Box<dyn Io>,
    identity: Identity,
    mut outgoing: Outgoing,
    signals: &mpsc::UnboundedSender<Signal>,
    options: &SocketOptions,
    cancel: CancellationToken,
) -> DisconnectReason {
    let codec = MessageCodec::new(options.format, options.max_message_size);
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FramedRead::new(reader, codec.clone());
    let mut writer = FramedWrite::new(writer, codec);

    let read = async {
        loop {
            let next = match options.heartbeat {
                Some(heartbeat) => match tokio::time::timeout(heartbeat.timeout, reader.next()).await {
                    Ok(next) => next,
                    Err(_) => return DisconnectReason::HeartbeatTimeout,
                },
                None => reader.next().await,
            };
            match next {
                Some(Ok(msg)) if msg.tag() == Tag::Heartbeat => {}
                Some(Ok(message)) => {
                    if signals.send(Signal::Message { identity, message }).is_err() {
                        return DisconnectReason::Closed;
                    }
                }
                Some(Err(CodecError::Io(err))) => return DisconnectReason::Io(err.to_string()),
                Some(Err(err)) => return DisconnectReason::Protocol(err.to_string()),
                None => return DisconnectReason::Eof,
            }
        }
    };

    let write = async {
        let mut ticker = options.heartbeat.map(|heartbeat| {
            let mut ticker = tokio::time::interval(heartbeat.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Ok(msg) = outgoing.rx.try_recv() {
                        let len = msg.payload_len();
                        if writer.feed(msg).await.is_err() {
                            break;
                        }
                        outgoing.written(len);
                    }
                    let _ = writer.flush().await;
                    let _ = writer.get_mut().shutdown().await;
                    return DisconnectReason::Closed;
                }
                msg = outgoing.rx.recv() => match msg {
                    Some(msg) => {
                        let len = msg.payload_len();
                        let tag = msg.tag();
                        match writer.send(msg).await {
                            Ok(()) => outgoing.written(len),
                            Err(CodecError::Io(err)) => return DisconnectReason::Io(err.to_string()),
                            // Our own message could not be framed. The peer is not at fault, so the session stays.
                            Err(err) => {
                                outgoing.written(len);
                                tracing::error!(peer = %identity, %tag, error = %err, "outgoing message dropped");
                            }
                        }
                    }
                    None => {
                        let _ = writer.get_mut().shutdown().await;
                        return DisconnectReason::Closed;
                    }
                },
                _ = tick(&mut ticker) => {
                    if let Err(err) = writer.send(Message::heartbeat()).await {
                        return write_failed(err);
                    }
                }
            }
        }
    };

    let reason = tokio::select! {
        reason = read => reason,
        reason = write => reason,
    };
    tracing::debug!(peer = %identity, %reason, "session ended");
    reason
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn write_failed(err: CodecError) -> DisconnectReason {
    match err {
        CodecError::Io(err) => DisconnectReason::Io(err.to_string()),
        err => DisconnectReason::Protocol(err.to_string()),
    }
}
