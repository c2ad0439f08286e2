use futures::prelude::*;
use kube::{runtime::watcher, Resource};
use std::pin::Pin;
use tokio::{sync::mpsc, time};
use tracing::{debug, info, warn, Instrument};

type EventStream<T> =
    Pin<Box<dyn Stream<Item = watcher::Result<watcher::Event<T>>> + Send + 'static>>;

/// Limits how quickly a failing watch is polled again.
const BACKOFF: time::Duration = time::Duration::from_secs(1);

/// A change to a watched resource collection.
#[derive(Clone, Debug, PartialEq)]
pub enum Event<T> {
    Applied(T),
    Deleted(T),

    /// The watch was (re)established. Holds every resource that currently exists, so consumers
    /// must reconcile against it rather than treat it as a series of additions.
    Restarted(Vec<T>),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying stream terminated. The caller should establish a new watch.
    #[error("watch stream closed")]
    Closed,

    /// The API server reported an error that the watch cannot recover from.
    #[error("watch failed: {0}")]
    Fatal(#[source] watcher::Error),
}

/// Drives a single resource watch, forwarding its events to a consumer.
pub struct Watch<T> {
    span: tracing::Span,
    rx: EventStream<T>,

    /// Buffers the initial listing between `Init` and `InitDone`.
    init: Option<Vec<T>>,
}

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = watcher::Result<watcher::Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self::new(watch.boxed())
    }
}

impl<T> Watch<T> {
    pub fn new(rx: EventStream<T>) -> Watch<T> {
        Self {
            rx,
            init: None,
            span: tracing::Span::current(),
        }
    }
}

impl<T> Watch<T>
where
    T: Resource + Send + 'static,
{
    /// Consumes the watch until its stream closes, sending each event on `tx`.
    ///
    /// Sends wait for the consumer to make room, so a slow consumer stalls the watch rather than
    /// accumulating events. Returns `Ok(())` when `shutdown` is signaled or the consumer goes
    /// away; returns [`Error::Closed`] when the stream ends.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<Event<T>>,
        shutdown: kubert::shutdown::Watch,
    ) -> Result<(), Error> {
        tokio::pin! {
            let shutdown = shutdown.signaled();
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!(parent: &self.span, "Shutdown signaled");
                    return Ok(());
                }
                next = self.rx.next().instrument(self.span.clone()) => next,
            };

            let event = match next {
                None => {
                    info!(parent: &self.span, "Watch stream closed");
                    return Err(Error::Closed);
                }

                Some(Ok(event)) => match self.process(event) {
                    Some(event) => event,
                    None => continue,
                },

                Some(Err(error)) if is_expired(&error) => {
                    // The watcher lists again on its next poll.
                    info!(parent: &self.span, %error, "Resource version expired");
                    continue;
                }

                Some(Err(error @ watcher::Error::WatchError(_))) => {
                    return Err(Error::Fatal(error));
                }

                Some(Err(error)) => {
                    info!(parent: &self.span, %error, "Failed");
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => return Ok(()),
                        _ = time::sleep(BACKOFF) => {}
                    }
                    info!(parent: &self.span, "Restarting");
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!(parent: &self.span, "Shutdown signaled");
                    return Ok(());
                }
                res = tx.send(event) => {
                    if res.is_err() {
                        debug!(parent: &self.span, "Event receiver dropped");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Translates a watcher event, returning `None` while an initial listing is being buffered or
    /// when the event's object is malformed.
    fn process(&mut self, event: watcher::Event<T>) -> Option<Event<T>> {
        match event {
            watcher::Event::Apply(obj) => self.validate(obj).map(Event::Applied),
            watcher::Event::Delete(obj) => self.validate(obj).map(Event::Deleted),
            watcher::Event::Init => {
                if self.init.replace(Vec::new()).is_some() {
                    debug!(parent: &self.span, "Discarding incomplete listing");
                }
                None
            }
            watcher::Event::InitApply(obj) => {
                if let Some(obj) = self.validate(obj) {
                    self.init.get_or_insert_with(Vec::new).push(obj);
                }
                None
            }
            watcher::Event::InitDone => {
                let objs = self.init.take().unwrap_or_default();
                debug!(parent: &self.span, count = objs.len(), "Listed");
                Some(Event::Restarted(objs))
            }
        }
    }

    fn validate(&self, obj: T) -> Option<T> {
        if obj.meta().name.is_none() {
            warn!(parent: &self.span, "Skipping event for object without a name");
            return None;
        }
        Some(obj)
    }
}

/// Runs watches built by `connect` until shutdown, establishing a new watch whenever the previous
/// one's stream closes.
///
/// Returns `Ok(())` on shutdown or when the consumer goes away, and [`Error::Fatal`] if a watch
/// fails.
pub async fn run_restarting<T, W>(
    mut connect: impl FnMut() -> W,
    tx: mpsc::Sender<Event<T>>,
    shutdown: kubert::shutdown::Watch,
) -> Result<(), Error>
where
    T: Resource + Send + 'static,
    W: Stream<Item = watcher::Result<watcher::Event<T>>> + Send + 'static,
{
    loop {
        match Watch::from(connect()).run(tx.clone(), shutdown.clone()).await {
            Err(Error::Closed) => info!("Restarting watch"),
            res => return res,
        }
    }
}

fn is_expired(error: &watcher::Error) -> bool {
    matches!(error, watcher::Error::WatchError(e) if e.code == 410)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;

    fn mk_ns(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn mk_watch(events: Vec<watcher::Result<watcher::Event<Namespace>>>) -> Watch<Namespace> {
        Watch::from(futures::stream::iter(events))
    }

    fn drain_events(rx: &mut mpsc::Receiver<Event<Namespace>>) -> Vec<Event<Namespace>> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn forwards_events_until_closed() {
        let (_signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(8);

        let watch = mk_watch(vec![
            Ok(watcher::Event::Apply(mk_ns("ns-0"))),
            Ok(watcher::Event::Delete(mk_ns("ns-0"))),
        ]);
        let res = watch.run(tx, shutdown).await;
        assert!(matches!(res, Err(Error::Closed)), "{res:?}");

        assert_eq!(
            drain_events(&mut rx),
            vec![
                Event::Applied(mk_ns("ns-0")),
                Event::Deleted(mk_ns("ns-0")),
            ]
        );
    }

    #[tokio::test]
    async fn folds_initial_listing() {
        let (_signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(8);

        let watch = mk_watch(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(mk_ns("ns-0"))),
            Ok(watcher::Event::InitApply(mk_ns("ns-1"))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Apply(mk_ns("ns-2"))),
        ]);
        let res = watch.run(tx, shutdown).await;
        assert!(matches!(res, Err(Error::Closed)), "{res:?}");

        assert_eq!(
            drain_events(&mut rx),
            vec![
                Event::Restarted(vec![mk_ns("ns-0"), mk_ns("ns-1")]),
                Event::Applied(mk_ns("ns-2")),
            ]
        );
    }

    #[tokio::test]
    async fn empty_listing_is_forwarded() {
        let (_signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(8);

        let watch = mk_watch(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitDone),
        ]);
        let res = watch.run(tx, shutdown).await;
        assert!(matches!(res, Err(Error::Closed)), "{res:?}");

        assert_eq!(drain_events(&mut rx), vec![Event::Restarted(vec![])]);
    }

    #[tokio::test]
    async fn skips_unnamed_objects() {
        let (_signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(8);

        let watch = mk_watch(vec![
            Ok(watcher::Event::Apply(Namespace::default())),
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(Namespace::default())),
            Ok(watcher::Event::InitApply(mk_ns("ns-0"))),
            Ok(watcher::Event::InitDone),
        ]);
        let res = watch.run(tx, shutdown).await;
        assert!(matches!(res, Err(Error::Closed)), "{res:?}");

        assert_eq!(
            drain_events(&mut rx),
            vec![Event::Restarted(vec![mk_ns("ns-0")])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_client_errors() {
        let (_signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(8);

        let watch = mk_watch(vec![
            Err(watcher::Error::NoResourceVersion),
            Ok(watcher::Event::Apply(mk_ns("ns-0"))),
        ]);
        let res = watch.run(tx, shutdown).await;
        assert!(matches!(res, Err(Error::Closed)), "{res:?}");

        assert_eq!(drain_events(&mut rx), vec![Event::Applied(mk_ns("ns-0"))]);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (signal, shutdown) = drain::channel();
        let (tx, _rx) = mpsc::channel(1);

        let watch = Watch::from(futures::stream::pending::<
            watcher::Result<watcher::Event<Namespace>>,
        >());
        let task = tokio::spawn(watch.run(tx, shutdown));

        signal.drain().await;
        let res = task.await.expect("task must not panic");
        assert!(res.is_ok(), "{res:?}");
    }

    #[tokio::test]
    async fn stops_when_consumer_is_gone() {
        let (_signal, shutdown) = drain::channel();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let watch = mk_watch(vec![Ok(watcher::Event::Apply(mk_ns("ns-0")))]);
        let res = watch.run(tx, shutdown).await;
        assert!(res.is_ok(), "{res:?}");
    }

    fn mk_error(code: u16) -> watcher::Error {
        watcher::Error::WatchError(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("watch failed with {code}"),
            reason: "Failure".to_string(),
            code,
        })
    }

    #[tokio::test]
    async fn fails_on_server_errors() {
        let (_signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(8);

        let watch = mk_watch(vec![
            Ok(watcher::Event::Apply(mk_ns("ns-0"))),
            Err(mk_error(500)),
            Ok(watcher::Event::Apply(mk_ns("ns-1"))),
        ]);
        let res = watch.run(tx, shutdown).await;
        assert!(
            matches!(res, Err(Error::Fatal(watcher::Error::WatchError(ref e))) if e.code == 500),
            "{res:?}"
        );

        assert_eq!(drain_events(&mut rx), vec![Event::Applied(mk_ns("ns-0"))]);
    }

    #[tokio::test]
    async fn continues_after_expired_resource_version() {
        let (_signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(8);

        let watch = mk_watch(vec![
            Ok(watcher::Event::Apply(mk_ns("ns-0"))),
            Err(mk_error(410)),
            Ok(watcher::Event::Apply(mk_ns("ns-1"))),
        ]);
        let res = watch.run(tx, shutdown).await;
        assert!(matches!(res, Err(Error::Closed)), "{res:?}");

        assert_eq!(
            drain_events(&mut rx),
            vec![
                Event::Applied(mk_ns("ns-0")),
                Event::Applied(mk_ns("ns-1")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_during_backoff() {
        let (signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(8);

        let watch = Watch::from(
            futures::stream::iter(vec![Err(watcher::Error::NoResourceVersion)])
                .chain(futures::stream::pending::<
                    watcher::Result<watcher::Event<Namespace>>,
                >()),
        );
        let start = time::Instant::now();
        let task = tokio::spawn(watch.run(tx, shutdown));

        // The clock only advances once the watch is idle in its backoff.
        time::sleep(time::Duration::from_millis(100)).await;
        signal.drain().await;

        let res = task.await.expect("task must not panic");
        assert!(res.is_ok(), "{res:?}");
        assert!(start.elapsed() < BACKOFF, "{:?}", start.elapsed());
        assert!(drain_events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn restarts_closed_watches() {
        let (_signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(8);

        let mut streams = vec![
            vec![Ok(watcher::Event::Apply(mk_ns("ns-0")))],
            vec![
                Ok(watcher::Event::Init),
                Ok(watcher::Event::InitApply(mk_ns("ns-1"))),
                Ok(watcher::Event::InitDone),
            ],
            vec![Err(mk_error(500))],
        ]
        .into_iter();
        let mut connects = 0;
        let res = run_restarting(
            || {
                connects += 1;
                futures::stream::iter(streams.next().expect("must not reconnect after failure"))
            },
            tx,
            shutdown,
        )
        .await;
        assert!(matches!(res, Err(Error::Fatal(_))), "{res:?}");
        assert_eq!(connects, 3);

        assert_eq!(
            drain_events(&mut rx),
            vec![
                Event::Applied(mk_ns("ns-0")),
                Event::Restarted(vec![mk_ns("ns-1")]),
            ]
        );
    }

    #[tokio::test]
    async fn restarts_until_shutdown() {
        let (signal, shutdown) = drain::channel();
        let (tx, mut rx) = mpsc::channel(1);

        let task = tokio::spawn(run_restarting(
            || futures::stream::iter(vec![Ok(watcher::Event::Apply(mk_ns("ns-0")))]),
            tx,
            shutdown,
        ));

        // Each new watch delivers the namespace again.
        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(Event::Applied(mk_ns("ns-0"))));
        }

        signal.drain().await;
        let res = task.await.expect("task must not panic");
        assert!(res.is_ok(), "{res:?}");
    }
}
