use crate::{
    core::{Error, ResourceRef},
    hub::{Message, Status, Subscriber},
    tunnel::ws,
};
use futures::prelude::*;
use serde::Deserialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{self, Duration},
};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

/// How long a closing channel may take to flush its final message.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A watch channel request.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Command {
    Subscribe(ResourceRef),
    Unsubscribe(ResourceRef),
}

/// Serves a watch channel until either side closes it.
///
/// Subscription failures are reported on the channel. The channel is closed when the subscriber
/// falls behind or sends something that cannot be understood.
pub(crate) async fn serve<S>(
    socket: WebSocketStream<S>,
    subscriber: Subscriber,
    mut queue: mpsc::Receiver<Message>,
    drain: drain::Watch,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (commands, events) = ws::frames::<_, Command, Message>(socket);
    tokio::pin!(commands, events);
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    let closed = loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break None,

            error = subscriber.disconnected() => break Some(error),

            msg = queue.recv() => match msg {
                // Writes yield to the hub disconnecting the subscriber and to shutdown.
                Some(msg) => tokio::select! {
                    biased;
                    _ = &mut shutdown => break None,
                    error = subscriber.disconnected() => break Some(error),
                    res = events.send(msg) => if let Err(error) = res {
                        debug!(%error, "Failed to write to watch channel");
                        return;
                    },
                },
                None => break None,
            },

            cmd = commands.next() => {
                let report = match cmd {
                    None => break None,
                    Some(Err(error)) => break Some(error),
                    Some(Ok(cmd)) => match command(&subscriber, cmd) {
                        Ok(report) => report,
                        Err(error) => break Some(error),
                    },
                };
                if let Some(status) = report {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break None,
                        error = subscriber.disconnected() => break Some(error),
                        res = events.send(status.into()) => if res.is_err() {
                            return;
                        },
                    }
                }
            }
        }
    };

    let id = subscriber.id();
    drop(subscriber);

    let close = async {
        if let Some(error) = closed {
            info!(%error, subscriber = id, "Closing watch channel");
            let status = Status::Error {
                error: error.to_string(),
                resource: None,
            };
            let _ = events.send(status.into()).await;
        }
        let _ = events.close().await;
    };
    if time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        debug!(subscriber = id, "Watch channel did not close in time");
    }
}

/// Applies a command, returning a status to report to the subscriber, or an error that closes
/// the channel.
fn command(subscriber: &Subscriber, cmd: Command) -> Result<Option<Status>, Error> {
    debug!(?cmd, subscriber = subscriber.id());
    match cmd {
        Command::Subscribe(resource) => match subscriber.subscribe(resource.clone()) {
            Ok(()) => Ok(None),
            Err(error @ (Error::Protocol(_) | Error::Backpressure)) => Err(error),
            Err(error) => Ok(Some(Status::Error {
                error: error.to_string(),
                resource: Some(resource),
            })),
        },
        Command::Unsubscribe(resource) => {
            if subscriber.unsubscribe(&resource) {
                return Ok(None);
            }
            Ok(Some(Status::Error {
                error: format!("not subscribed to {resource}"),
                resource: Some(resource),
            }))
        }
    }
}
