//! Handler registration on remote event emitters.
//!
//! The remote side sees a fresh object every time a local object crosses the
//! boundary unpinned, so `emitter.off(event, handler)` could never match the
//! handler `on` registered. Registration therefore pins the handler: its
//! assigned FFID is reused for every later crossing. The session's callback
//! table is keyed by that FFID and the event name, since one pinned handler
//! may be registered for several events.
//!
//! Remote runtimes that need the legacy emitter shims do not bind the
//! emitter when invoking handlers; with shims enabled the handler is wrapped
//! so it receives the emitter as its first argument. The wrapper holds the
//! emitter proxy and so the session; the event loop empties the callback
//! table when it stops, which lets that session go.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::error::Error;
use crate::error::Result;
use crate::proxy::Proxy;
use crate::session::Callback;
use crate::value::LocalRef;
use crate::value::Value;

/// Registers `handler` for `event`. Returns what the remote side holds, which
/// [`off`] also accepts.
pub async fn on(emitter: &Proxy, event: &str, handler: LocalRef) -> Result<LocalRef> {
    let session = emitter.session();
    let registered = if session.legacy_shims() {
        with_emitter(emitter.clone(), handler.clone())
    } else {
        handler.clone()
    };

    subscribe(emitter, "on", event, &registered).await?;
    let ffid = pinned_ffid(&registered, event)?;
    session
        .callbacks
        .insert((ffid, event.to_owned()), Callback { handler, registered: registered.clone() });
    Ok(registered)
}

/// Registers `handler` for the next `event` only. The callback table entry
/// goes away after the first invocation.
pub async fn once(emitter: &Proxy, event: &str, handler: LocalRef) -> Result<LocalRef> {
    let session = emitter.session();
    let shim_emitter = session.legacy_shims().then(|| emitter.clone());
    let weak = Arc::downgrade(session);
    let slot: Arc<OnceLock<u64>> = Arc::new(OnceLock::new());
    let fired = Arc::new(AtomicBool::new(false));

    let registered = {
        let handler = handler.clone();
        let slot = slot.clone();
        let fired = fired.clone();
        let event = event.to_owned();
        LocalRef::function(format!("once {}", handler.describe()), move |args: Vec<Value>| {
            let handler = handler.clone();
            let shim_emitter = shim_emitter.clone();
            let weak = weak.clone();
            let slot = slot.clone();
            let fired = fired.clone();
            let event = event.clone();
            async move {
                let args = match shim_emitter {
                    Some(emitter) => prepend(emitter, args),
                    None => args,
                };
                let result = handler.call(args).await;
                fired.store(true, Ordering::Release);
                if let (Some(session), Some(ffid)) = (weak.upgrade(), slot.get()) {
                    session.callbacks.remove(&(*ffid, event));
                }
                result
            }
        })
    };

    subscribe(emitter, "once", event, &registered).await?;
    let ffid = pinned_ffid(&registered, event)?;
    let _ = slot.set(ffid);
    // it may already have fired before registration returned
    if !fired.load(Ordering::Acquire) {
        session
            .callbacks
            .insert((ffid, event.to_owned()), Callback { handler, registered: registered.clone() });
    }
    Ok(registered)
}

/// Unregisters a handler registered for `event` through [`on`] or [`once`].
/// Accepts the handler as passed in or as returned.
pub async fn off(emitter: &Proxy, event: &str, handler: &LocalRef) -> Result<()> {
    let session = emitter.session();
    let found = session
        .callbacks
        .iter()
        .find(|entry| {
            let same = entry.handler.ptr_eq(handler) || entry.registered.ptr_eq(handler);
            same && entry.key().1 == event
        })
        .map(|entry| (entry.key().clone(), entry.registered.clone()));
    let Some((key, registered)) = found else {
        return Err(Error::InvalidArgument(format!(
            "{} is not registered for '{}'",
            handler.describe(),
            event
        )));
    };

    subscribe(emitter, "off", event, &registered).await?;
    session.callbacks.remove(&key);
    Ok(())
}

async fn subscribe(emitter: &Proxy, method: &str, event: &str, handler: &LocalRef) -> Result<()> {
    let subscribe = emitter.get(method).await?.into_proxy()?;
    subscribe.call(vec![Value::from(event), Value::Local(handler.clone())]).await?;
    Ok(())
}

fn pinned_ffid(registered: &LocalRef, event: &str) -> Result<u64> {
    let ffid = registered.ffid().ok_or_else(|| {
        Error::ProtocolViolation(format!(
            "{} was not assigned an ffid when registered for '{}'",
            registered.describe(),
            event
        ))
    })?;
    registered.pin();
    Ok(ffid)
}

fn with_emitter(emitter: Proxy, handler: LocalRef) -> LocalRef {
    LocalRef::function(format!("{} with emitter", handler.describe()), move |args: Vec<Value>| {
        let emitter = emitter.clone();
        let handler = handler.clone();
        async move { handler.call(prepend(emitter, args)).await }
    })
}

fn prepend(emitter: Proxy, args: Vec<Value>) -> Vec<Value> {
    let mut full = Vec::with_capacity(args.len() + 1);
    full.push(Value::Remote(emitter));
    full.extend(args);
    full
}
