//! # Event Loop
//!
//! The only reader of the transport and the only fulfiller of the response
//! registry.
//!
//! ## Structure
//!
//! A reader task pulls frames off the transport and forwards them over a
//! channel; the loop task selects over that channel, the free-flush tick and
//! control requests. Reads never happen inside a `select!` branch that could
//! be cancelled halfway through a frame.
//!
//! ## Invariants
//!
//! - After handing over an FFID-assignment reply, the loop waits until the
//!   caller released it before looking at the next frame. Other replies never
//!   hold the loop.
//! - Remote invocations of local objects run on their own task, so a local
//!   callback can make proxy calls of its own.
//! - A bad frame is logged and dropped; it never stops the loop.
//! - Free requests go out only from here.

use std::sync::Arc;

use exowire::Frame;
use exowire::Invoke;
use exowire::InvokeAction;
use exowire::Key;
use exowire::Kind;
use exowire::ROOT_FFID;
use exowire::Request;
use exowire::Response;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::error::Result;
use crate::executor::outbound;
use crate::registry::Delivery;
use crate::session::Session;
use crate::transport::Transport;
use crate::value::Value;

/// Requests from the rest of the session to the loop.
#[derive(Debug)]
pub(crate) enum Control {
    /// Send pending frees now, then signal.
    Flush(oneshot::Sender<()>),
    /// Send pending frees and stop.
    Shutdown,
}

/// Spawns the reader and loop tasks. Must be called inside a tokio runtime.
pub(crate) fn spawn(session: Arc<Session>, control: mpsc::UnboundedReceiver<Control>) -> JoinHandle<()> {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_frames(session.transport.clone(), frames_tx));

    tokio::spawn(async move {
        run(&session, frames_rx, control).await;
        reader.abort();
        session.mark_stopped();
        debug!(pending = session.registry.pending_count(), "event loop stopped");
    })
}

async fn read_frames(transport: Arc<dyn Transport>, frames: mpsc::UnboundedSender<Vec<u8>>) {
    loop {
        match transport.recv().await {
            Ok(Some(bytes)) => {
                if frames.send(bytes).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("transport closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "transport read failed");
                break;
            }
        }
    }
}

async fn run(
    session: &Arc<Session>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let mut ticker = tokio::time::interval(session.config.free_flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(bytes) => dispatch(session, &bytes).await,
                None => break,
            },
            _ = ticker.tick() => flush_frees(session).await,
            request = control.recv() => match request {
                Some(Control::Flush(done)) => {
                    flush_frees(session).await;
                    let _ = done.send(());
                }
                Some(Control::Shutdown) | None => {
                    flush_frees(session).await;
                    break;
                }
            },
        }
    }
}

async fn dispatch(session: &Arc<Session>, bytes: &[u8]) {
    if session.config.debug {
        debug!(frame = %String::from_utf8_lossy(bytes), "<- recv");
    }

    let frame = match Frame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return;
        }
    };

    match frame {
        Frame::Reply(reply) => {
            let r = reply.r;
            match session.registry.fulfill(reply) {
                Ok(Delivery::Delivered) => {}
                // resolves (with an error) once the caller lets go of the reply
                Ok(Delivery::Held(released)) => {
                    let _ = released.await;
                }
                Ok(Delivery::Discarded) => debug!(r, "discarding reply nobody waits for"),
                Err(e) => warn!(r, error = %e, "dropping reply"),
            }
        }
        Frame::Invoke(invoke) => {
            let session = session.clone();
            tokio::spawn(async move { answer_invoke(session, invoke).await });
        }
        Frame::Destroy(ffids) => {
            for ffid in ffids {
                match session.refs.release(ffid) {
                    Some(released) => trace!(ffid, object = %released.describe(), "released local object"),
                    None => debug!(ffid, "destroy notification for unknown ffid"),
                }
            }
        }
    }
}

async fn answer_invoke(session: Arc<Session>, invoke: Invoke) {
    let r = invoke.r;
    let ffid = invoke.ffid;
    let action = invoke.action;

    let response = match invoke_local(&session, invoke).await {
        Ok((kind, val)) => Response::ok(r, kind, val),
        Err(e) => {
            debug!(r, ffid, ?action, error = %e, "local invocation failed");
            Response::err(r, &e.to_failure())
        }
    };

    let sent: Result<()> = match response.encode() {
        Ok(bytes) => {
            if session.config.debug {
                debug!(frame = %String::from_utf8_lossy(&bytes), "-> send");
            }
            session.transport.send(&bytes).await.map_err(Into::into)
        }
        Err(e) => Err(e.into()),
    };
    if let Err(e) = sent {
        warn!(r, ffid, error = %e, "failed to answer remote invocation");
    }
}

async fn invoke_local(session: &Arc<Session>, invoke: Invoke) -> Result<(Kind, Json)> {
    let object = session.resolve(invoke.ffid)?;
    match invoke.action {
        InvokeAction::Call => {
            let args = invoke.args.into_iter().map(|arg| session.lift(arg)).collect();
            reply_value(object.call(args).await?)
        }
        InvokeAction::Get => {
            let key = invoke.key.unwrap_or_else(Key::empty);
            reply_value(object.get(&key).await?)
        }
        InvokeAction::Inspect => Ok((Kind::Value("val".into()), Json::String(object.describe()))),
    }
}

fn reply_value(value: Value) -> Result<(Kind, Json)> {
    match value {
        Value::Void => Ok((Kind::Void, Json::Null)),
        other => Ok((Kind::Value("val".into()), outbound(&other)?)),
    }
}

/// Sends one free request for every queued FFID no live proxy holds any more.
pub(crate) async fn flush_frees(session: &Session) {
    let ffids: Vec<_> = session
        .frees
        .drain()
        .into_iter()
        .filter(|ffid| *ffid != ROOT_FFID && session.refs.remote_count(*ffid) == 0)
        .collect();
    if ffids.is_empty() {
        return;
    }

    debug!(count = ffids.len(), "flushing frees");
    let request = Request::free(session.next_ids(1), ffids);
    if let Err(e) = session.send_request(&request).await {
        warn!(error = %e, "failed to send free request");
    }
}
