// Snapshot stream adapter
//
// Wraps one connection-feed transport. A single tokio task reads frames,
// decodes each into a Snapshot and dispatches it synchronously to the
// listeners registered for that event, in arrival order. The task is only
// spawned by `start`, so listeners registered before it see every frame.

use crate::model::{Snapshot, decode_snapshot};
use futures_util::{Stream, StreamExt, stream};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEvent {
    /// A decoded snapshot
    Data,
    /// The transport ended or failed; sent at most once
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Data(Snapshot),
    Closed,
}

impl StreamMessage {
    pub fn event(&self) -> StreamEvent {
        match self {
            StreamMessage::Data(_) => StreamEvent::Data,
            StreamMessage::Closed => StreamEvent::Closed,
        }
    }
}

/// Registration token returned by [`SnapshotStream::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: StreamEvent,
    id: u64,
}

type Handler = Box<dyn Fn(&StreamMessage) + Send + Sync>;
type ReadLoop = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Listener {
    subscription: Subscription,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<Listener>,
    destroyed: bool,
}

impl Registry {
    /// Returns false once the stream has been destroyed
    fn dispatch(&self, message: &StreamMessage) -> bool {
        if self.destroyed {
            return false;
        }
        let event = message.event();
        for listener in self
            .listeners
            .iter()
            .filter(|l| l.subscription.event == event)
        {
            (listener.handler)(message);
        }
        true
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One live connection feed with its listener registry
///
/// Handlers run inside the read loop while the registry is locked, so they
/// must not call back into the stream; forward into a channel instead.
pub struct SnapshotStream {
    registry: Arc<Mutex<Registry>>,
    pending: Option<ReadLoop>,
    task: Option<JoinHandle<()>>,
}

impl SnapshotStream {
    /// Wrap a stream where every item is one complete frame (e.g. websocket
    /// messages). Nothing is read until [`SnapshotStream::start`].
    pub fn from_frames<S, F, E>(frames: S) -> Self
    where
        S: Stream<Item = Result<F, E>> + Send + 'static,
        F: AsRef<[u8]> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let pending: ReadLoop = Box::pin(read_loop(frames, Arc::clone(&registry)));

        Self {
            registry,
            pending: Some(pending),
            task: None,
        }
    }

    /// Wrap a chunked byte stream carrying newline-delimited frames
    pub fn from_bytes<S, B, E>(bytes: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self::from_frames(split_lines(bytes))
    }

    /// Spawn the read loop. Subscribe first: frames are dispatched as soon
    /// as they are read. Must be called inside a tokio runtime; later calls
    /// do nothing.
    pub fn start(&mut self) {
        if let Some(read_loop) = self.pending.take() {
            self.task = Some(tokio::spawn(read_loop));
        }
    }

    /// Register `handler` for `event`. Several handlers may share an event.
    pub fn subscribe<H>(&self, event: StreamEvent, handler: H) -> Subscription
    where
        H: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let subscription = Subscription {
            event,
            id: registry.next_id,
        };
        registry.next_id += 1;

        if registry.destroyed {
            log::debug!("Ignoring {:?} subscription on a destroyed stream", event);
        } else {
            registry.listeners.push(Listener {
                subscription,
                handler: Box::new(handler),
            });
        }

        subscription
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.listeners.len();
        registry
            .listeners
            .retain(|l| l.subscription != subscription);
        registry.listeners.len() != before
    }

    pub fn listener_count(&self, event: StreamEvent) -> usize {
        lock(&self.registry)
            .listeners
            .iter()
            .filter(|l| l.subscription.event == event)
            .count()
    }

    /// Close the transport and drop every listener. Once this returns no
    /// handler runs again, even for frames already read.
    pub fn destroy(&mut self) {
        {
            let mut registry = lock(&self.registry);
            if !registry.destroyed {
                log::debug!(
                    "Destroying snapshot stream ({} listener(s))",
                    registry.listeners.len()
                );
            }
            registry.destroyed = true;
            registry.listeners.clear();
        }

        self.pending = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.registry).destroyed
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn read_loop<S, F, E>(frames: S, registry: Arc<Mutex<Registry>>)
where
    S: Stream<Item = Result<F, E>>,
    F: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut frames = Box::pin(frames);
    let mut delivered = 0u64;

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Connection feed read failed: {}", e);
                break;
            }
        };

        let snapshot = match decode_snapshot(frame.as_ref()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Discarding malformed snapshot frame: {:#}", e);
                continue;
            }
        };

        let alive = lock(&registry).dispatch(&StreamMessage::Data(snapshot));
        if !alive {
            return;
        }
        delivered += 1;
    }

    log::info!("Connection feed ended after {} snapshot(s)", delivered);
    lock(&registry).dispatch(&StreamMessage::Closed);
}

/// Buffers byte chunks and yields newline-terminated frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame, skipping blank keep-alive lines
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let newline = self.buffer.iter().position(|b| *b == b'\n')?;
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !is_blank(&line) {
                return Some(line);
            }
        }
    }

    /// Whatever is left once the source has ended
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        if is_blank(&rest) { None } else { Some(rest) }
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

fn split_lines<S, B, E>(source: S) -> impl Stream<Item = Result<Vec<u8>, E>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
{
    let state = (Box::pin(source), FrameDecoder::default(), false);

    stream::unfold(state, |(mut source, mut decoder, mut ended)| async move {
        loop {
            if let Some(frame) = decoder.next_frame() {
                return Some((Ok(frame), (source, decoder, ended)));
            }
            if ended {
                return decoder
                    .finish()
                    .map(|frame| (Ok(frame), (source, decoder, ended)));
            }
            match source.next().await {
                Some(Ok(chunk)) => decoder.push(chunk.as_ref()),
                Some(Err(e)) => return Some((Err(e), (source, decoder, true))),
                None => ended = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Frame = Result<Vec<u8>, io::Error>;

    fn frame(upload_total: u64, ids: &[&str]) -> Vec<u8> {
        let connections: Vec<String> = ids
            .iter()
            .map(|id| {
                format!(
                    r#"{{"id":"{}","metadata":{{"network":"tcp","type":"HTTP","host":"h","destinationIP":"1.1.1.1","destinationPort":"80"}},"upload":1,"download":2,"start":"2024-05-01T12:00:00Z","chains":["DIRECT"],"rule":"Match","rulePayload":""}}"#,
                    id
                )
            })
            .collect();
        format!(
            r#"{{"uploadTotal":{},"downloadTotal":0,"connections":[{}]}}"#,
            upload_total,
            connections.join(",")
        )
        .into_bytes()
    }

    /// A frame source the test feeds by hand
    fn channel_source() -> (
        mpsc::UnboundedSender<Frame>,
        impl Stream<Item = Frame> + Send + 'static,
    ) {
        let (tx, rx) = mpsc::unbounded_channel::<Frame>();
        let source = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, source)
    }

    fn forward(
        stream: &SnapshotStream,
        event: StreamEvent,
    ) -> (Subscription, mpsc::UnboundedReceiver<StreamMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = stream.subscribe(event, move |message| {
            let _ = tx.send(message.clone());
        });
        (subscription, rx)
    }

    async fn next_total(rx: &mut mpsc::UnboundedReceiver<StreamMessage>) -> u64 {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(StreamMessage::Data(snapshot))) => snapshot.upload_total,
            other => panic!("expected a snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_decoder_splits_chunks() {
        let mut decoder = FrameDecoder::default();
        decoder.push(b"{\"a\":");
        assert_eq!(decoder.next_frame(), None);

        decoder.push(b"1}\r\n\n  \n{\"b\":2}\n{\"c\"");
        assert_eq!(decoder.next_frame(), Some(b"{\"a\":1}".to_vec()));
        assert_eq!(decoder.next_frame(), Some(b"{\"b\":2}".to_vec()));
        assert_eq!(decoder.next_frame(), None);

        decoder.push(b":3}");
        assert_eq!(decoder.finish(), Some(b"{\"c\":3}".to_vec()));
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn test_dispatches_every_frame_in_order_to_all_listeners() {
        let (tx, source) = channel_source();
        let mut stream = SnapshotStream::from_frames(source);
        let (_, mut first) = forward(&stream, StreamEvent::Data);
        let (_, mut second) = forward(&stream, StreamEvent::Data);
        assert_eq!(stream.listener_count(StreamEvent::Data), 2);
        stream.start();

        for total in 1..=3 {
            tx.send(Ok(frame(total, &["a"]))).unwrap();
        }

        for total in 1..=3 {
            assert_eq!(next_total(&mut first).await, total);
            assert_eq!(next_total(&mut second).await, total);
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (tx, source) = channel_source();
        let mut stream = SnapshotStream::from_frames(source);
        let (_, mut rx) = forward(&stream, StreamEvent::Data);
        stream.start();

        tx.send(Ok(b"{\"uploadTotal\": oops".to_vec())).unwrap();
        tx.send(Ok(br#"{"uploadTotal": 1, "downloadTotal": 1}"#.to_vec()))
            .unwrap();
        tx.send(Ok(frame(7, &["a", "b"]))).unwrap();

        assert_eq!(next_total(&mut rx).await, 7);
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_stops_receiving() {
        let (tx, source) = channel_source();
        let mut stream = SnapshotStream::from_frames(source);
        let (subscription, mut dropped) = forward(&stream, StreamEvent::Data);
        let (_, mut kept) = forward(&stream, StreamEvent::Data);
        stream.start();

        assert!(stream.unsubscribe(subscription));
        assert!(!stream.unsubscribe(subscription));

        tx.send(Ok(frame(1, &[]))).unwrap();
        assert_eq!(next_total(&mut kept).await, 1);
        assert!(dropped.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_dispatch_after_destroy() {
        let (tx, source) = channel_source();
        let mut stream = SnapshotStream::from_frames(source);
        let (_, mut rx) = forward(&stream, StreamEvent::Data);
        stream.start();

        tx.send(Ok(frame(1, &["a"]))).unwrap();
        assert_eq!(next_total(&mut rx).await, 1);

        stream.destroy();
        assert!(stream.is_destroyed());
        assert_eq!(stream.listener_count(StreamEvent::Data), 0);

        let _ = tx.send(Ok(frame(2, &["a"])));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The handler was dropped with the registry, closing the channel
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_after_destroy_is_ignored() {
        let (_tx, source) = channel_source();
        let mut stream = SnapshotStream::from_frames(source);
        stream.destroy();

        let (_, _rx) = forward(&stream, StreamEvent::Data);
        assert_eq!(stream.listener_count(StreamEvent::Data), 0);
    }

    #[tokio::test]
    async fn test_transport_end_notifies_closed_listeners() {
        let (tx, source) = channel_source();
        let mut stream = SnapshotStream::from_frames(source);
        let (_, mut data) = forward(&stream, StreamEvent::Data);
        let (_, mut closed) = forward(&stream, StreamEvent::Closed);
        stream.start();

        tx.send(Ok(frame(1, &[]))).unwrap();
        tx.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();
        let _ = tx.send(Ok(frame(2, &[])));

        assert_eq!(next_total(&mut data).await, 1);
        let message = tokio::time::timeout(Duration::from_secs(2), closed.recv())
            .await
            .unwrap();
        assert_eq!(message, Some(StreamMessage::Closed));
        assert!(data.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_byte_stream_is_split_into_frames() {
        let mut payload = frame(1, &["a"]);
        payload.push(b'\n');
        payload.extend(frame(2, &["a", "b"]));
        payload.extend_from_slice(b"\n");
        payload.extend(frame(3, &[]));

        // Chunk boundaries that cut through frames
        let chunks: Vec<Frame> = payload.chunks(37).map(|c| Ok(c.to_vec())).collect();
        let mut stream = SnapshotStream::from_bytes(stream::iter(chunks));
        let (_, mut rx) = forward(&stream, StreamEvent::Data);
        let (_, mut closed) = forward(&stream, StreamEvent::Closed);
        stream.start();

        assert_eq!(next_total(&mut rx).await, 1);
        assert_eq!(next_total(&mut rx).await, 2);
        assert_eq!(next_total(&mut rx).await, 3);
        assert_eq!(closed.recv().await, Some(StreamMessage::Closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_buffered_feed_waits_for_start() {
        // The whole response is already buffered when listeners register
        let mut payload = frame(5, &["a"]);
        payload.push(b'\n');
        let chunks: Vec<Frame> = vec![Ok(payload)];
        let mut stream = SnapshotStream::from_bytes(stream::iter(chunks));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_, mut data) = forward(&stream, StreamEvent::Data);
        let (_, mut closed) = forward(&stream, StreamEvent::Closed);
        stream.start();
        stream.start();

        assert_eq!(next_total(&mut data).await, 5);
        let message = tokio::time::timeout(Duration::from_secs(2), closed.recv())
            .await
            .unwrap();
        assert_eq!(message, Some(StreamMessage::Closed));
        assert!(data.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_before_start_never_reads() {
        let (tx, source) = channel_source();
        let mut stream = SnapshotStream::from_frames(source);
        let (_, mut rx) = forward(&stream, StreamEvent::Data);

        stream.destroy();
        stream.start();

        let _ = tx.send(Ok(frame(1, &[])));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
