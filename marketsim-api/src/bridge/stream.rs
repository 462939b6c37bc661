use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// Status the forwarder stopped with, shared with the handler's stream
#[derive(Clone, Default)]
struct SendFailure(Arc<Mutex<Option<Status>>>);

impl SendFailure {
    fn set(&self, status: Status) {
        self.0.lock().get_or_insert(status);
    }

    fn get(&self) -> Option<Status> {
        self.0.lock().clone()
    }

    fn or_cancelled(&self, message: &str) -> Status {
        self.get().unwrap_or_else(|| Status::cancelled(message.to_string()))
    }
}

/// Sending half handed to a streaming handler
///
/// Messages go through a bounded channel to the forwarder. The attached
/// [`CancellationToken`] fires when either the transport or the handler side
/// gives up.
pub struct ServerStream<T> {
    tx: mpsc::Sender<T>,
    ctx: CancellationToken,
    failure: SendFailure,
}

impl<T: Send> ServerStream<T> {
    /// Queue one message, waiting for room in the channel
    ///
    /// Fails once the stream is cancelled or the forwarder is gone. If the
    /// transport rejected a write, that status is returned unchanged.
    pub async fn send(&self, msg: T) -> Result<(), Status> {
        if self.ctx.is_cancelled() {
            return Err(self.failure.or_cancelled("stream cancelled"));
        }

        tokio::select! {
            biased;
            () = self.ctx.cancelled() => Err(self.failure.or_cancelled("stream cancelled")),
            res = self.tx.send(msg) => res.map_err(|_| self.failure.or_cancelled("stream closed by peer")),
        }
    }

    /// Why the transport stopped accepting messages, if it did
    pub fn send_error(&self) -> Option<Status> {
        self.failure.get()
    }

    /// Cancellation scope of the request
    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    // Headers and trailers are owned by the transport; handlers cannot set them.
    pub fn set_header(&self, _headers: MetadataMap) {}

    pub fn set_trailer(&self, _trailers: MetadataMap) {}
}

/// Transport-specific writer for one response stream
#[async_trait]
pub trait StreamSink<T: Send + 'static>: Send + Sync + 'static {
    /// Write one message to the peer
    async fn send(&mut self, msg: T) -> Result<(), Status>;

    /// Resolves once the peer has stopped reading
    async fn closed(&self);

    /// Report how the handler finished
    async fn finish(&mut self, result: Result<(), Status>);
}

/// Bounded channel feeding a forwarder
pub fn channel<T>(capacity: usize, ctx: CancellationToken) -> (ServerStream<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stream = ServerStream {
        tx,
        ctx,
        failure: SendFailure::default(),
    };
    (stream, rx)
}

/// Drain `rx` into `sink` until the handler is done or either side cancels
///
/// A closed or failing sink records its status on `failure` before cancelling
/// `ctx`, so the handler's pending or next send sees that status.
/// The sink is handed back so the caller can still report the final status.
async fn forward<T, S>(
    mut rx: mpsc::Receiver<T>,
    mut sink: S,
    ctx: CancellationToken,
    failure: SendFailure,
) -> (S, Result<(), Status>)
where
    T: Send + 'static,
    S: StreamSink<T>,
{
    let fail = |status: Status| {
        failure.set(status.clone());
        ctx.cancel();
        Err(status)
    };

    loop {
        let msg = tokio::select! {
            biased;
            () = ctx.cancelled() => return (sink, Ok(())),
            () = sink.closed() => return (sink, fail(Status::cancelled("peer went away"))),
            msg = rx.recv() => msg,
        };

        let Some(msg) = msg else {
            return (sink, Ok(()));
        };

        let sent = tokio::select! {
            biased;
            () = ctx.cancelled() => return (sink, Ok(())),
            res = sink.send(msg) => res,
        };

        if let Err(status) = sent {
            return (sink, fail(status));
        }
    }
}

/// Run `handler` against a fresh [`ServerStream`] and forward its output to `sink`
///
/// Both halves run on one task. When the handler returns its stream is dropped,
/// which ends the forwarder; when the forwarder stops first, `ctx` is cancelled
/// and the handler's next send fails with the forwarder's status. The task
/// resolves to the handler's result.
pub fn spawn_bridged<T, S, F, Fut>(
    ctx: CancellationToken,
    capacity: usize,
    sink: S,
    handler: F,
) -> JoinHandle<Result<(), Status>>
where
    T: Send + 'static,
    S: StreamSink<T>,
    F: FnOnce(ServerStream<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    let (stream, rx) = channel(capacity, ctx.clone());
    let failure = stream.failure.clone();
    tokio::spawn(async move {
        let (result, (mut sink, forwarded)) =
            tokio::join!(handler(stream), forward(rx, sink, ctx.clone(), failure));

        match forwarded {
            Ok(()) => sink.finish(result.clone()).await,
            Err(status) => {
                tracing::debug!(code = ?status.code(), "Stream forwarding stopped: {}", status.message());
            }
        }
        ctx.cancel();
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<u32>>>,
        finished: Arc<Mutex<Option<Result<(), Status>>>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl StreamSink<u32> for RecordingSink {
        async fn send(&mut self, msg: u32) -> Result<(), Status> {
            let mut sent = self.sent.lock();
            if self.fail_after.is_some_and(|n| sent.len() >= n) {
                return Err(Status::unavailable("peer reset"));
            }
            sent.push(msg);
            Ok(())
        }

        async fn closed(&self) {
            std::future::pending::<()>().await;
        }

        async fn finish(&mut self, result: Result<(), Status>) {
            *self.finished.lock() = Some(result);
        }
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order_then_finish() {
        let sink = RecordingSink::default();
        let handle = spawn_bridged(CancellationToken::new(), 2, sink.clone(), |stream| async move {
            for i in 0..5 {
                stream.send(i).await?;
            }
            Ok(())
        });

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(*sink.sent.lock(), vec![0, 1, 2, 3, 4]);
        assert!(matches!(*sink.finished.lock(), Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_handler_error_is_reported_to_sink() {
        let sink = RecordingSink::default();
        let handle = spawn_bridged(CancellationToken::new(), 4, sink.clone(), |stream: ServerStream<u32>| async move {
            stream.send(7).await?;
            Err(Status::invalid_argument("bad symbol"))
        });

        let result = handle.await.unwrap();
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
        let finished = sink.finished.lock().clone().unwrap();
        assert_eq!(finished.unwrap_err().message(), "bad symbol");
    }

    #[tokio::test]
    async fn test_sink_failure_stops_handler() {
        let sink = RecordingSink {
            fail_after: Some(2),
            ..RecordingSink::default()
        };
        let ctx = CancellationToken::new();
        let handle = spawn_bridged(ctx.clone(), 1, sink.clone(), |stream| async move {
            let mut i = 0;
            loop {
                stream.send(i).await?;
                i += 1;
            }
        });

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        let status = result.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(status.message(), "peer reset");
        assert!(ctx.is_cancelled());
        assert_eq!(sink.sent.lock().len(), 2);
        // the sink is gone, nothing to finish
        assert!(sink.finished.lock().is_none());
    }

    #[tokio::test]
    async fn test_send_error_reaches_handler_unchanged() {
        let sink = RecordingSink {
            fail_after: Some(0),
            ..RecordingSink::default()
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let handle = spawn_bridged(CancellationToken::new(), 1, sink, move |stream| async move {
            for i in 0..3 {
                if let Err(status) = stream.send(i).await {
                    record.lock().push(status.code());
                }
            }
            Err(stream.send_error().unwrap_or_else(|| Status::internal("no send error")))
        });

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err().code(), tonic::Code::Unavailable);
        let seen = seen.lock();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|code| *code == tonic::Code::Unavailable));
    }

    #[tokio::test]
    async fn test_send_after_cancel_fails_fast() {
        let ctx = CancellationToken::new();
        let (stream, _rx) = channel::<u32>(1, ctx.clone());
        stream.send(1).await.unwrap();

        ctx.cancel();
        let err = stream.send(2).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Cancelled);
    }

    #[tokio::test]
    async fn test_send_blocked_on_full_channel_unblocks_on_cancel() {
        let ctx = CancellationToken::new();
        let (stream, _rx) = channel::<u32>(1, ctx.clone());
        stream.send(1).await.unwrap();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), stream.send(2)).await.unwrap();
        assert!(result.is_err());
    }
}
