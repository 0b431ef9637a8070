//! The guest message loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use plughost_core::{GuestMessage, HandlerOutcome, HostMessage, PROTOCOL_VERSION};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SdkError, SdkResult};
use crate::guest::{Guest, HookContext, Invocation};
use crate::host::HostApi;

type Running = Arc<Mutex<HashMap<u64, CancellationToken>>>;

/// Run `guest` against a host connection until the host sends
/// [`HostMessage::Shutdown`] or closes `inbox`.
///
/// Sends [`GuestMessage::Ready`] first. Each invocation runs on its own task
/// so a slow handler never blocks cancellation requests or host replies. A
/// handler that panics is reported as a failed call.
///
/// # Errors
///
/// Returns [`SdkError::Disconnected`] if the host is gone before the ready
/// announcement can be sent.
pub async fn serve(
    guest: Arc<dyn Guest>,
    mut inbox: mpsc::UnboundedReceiver<HostMessage>,
    outbox: mpsc::UnboundedSender<GuestMessage>,
) -> SdkResult<()> {
    let host = HostApi::new(outbox.clone());
    outbox
        .send(GuestMessage::Ready {
            protocol: PROTOCOL_VERSION,
        })
        .map_err(|_| SdkError::Disconnected)?;

    let running: Running = Arc::new(Mutex::new(HashMap::new()));

    while let Some(message) = inbox.recv().await {
        match message {
            HostMessage::Invoke {
                call_id,
                hook,
                handler,
                payload,
            } => {
                let token = CancellationToken::new();
                lock(&running).insert(call_id, token.clone());
                let call = Invocation {
                    call_id,
                    hook,
                    handler,
                    payload,
                };
                let ctx = HookContext::new(host.clone(), token.clone());
                tokio::spawn(run_call(
                    Arc::clone(&guest),
                    call,
                    ctx,
                    token,
                    Arc::clone(&running),
                    outbox.clone(),
                ));
            },
            HostMessage::Cancel { call_id } => {
                if let Some(token) = lock(&running).get(&call_id) {
                    debug!(call_id, "cancelling call");
                    token.cancel();
                }
            },
            HostMessage::HostReply { request_id, result } => host.resolve(request_id, result),
            HostMessage::Shutdown => {
                debug!("shutdown requested");
                break;
            },
        }
    }

    for token in lock(&running).values() {
        token.cancel();
    }
    host.disconnect();
    Ok(())
}

async fn run_call(
    guest: Arc<dyn Guest>,
    call: Invocation,
    ctx: HookContext,
    token: CancellationToken,
    running: Running,
    outbox: mpsc::UnboundedSender<GuestMessage>,
) {
    let call_id = call.call_id;
    let joined = tokio::spawn(async move { guest.on_invoke(call, ctx).await }).await;
    let outcome = match joined {
        Ok(Ok(value)) => HandlerOutcome::Ok { value },
        Ok(Err(_)) if token.is_cancelled() => HandlerOutcome::Cancelled,
        Ok(Err(message)) => HandlerOutcome::Error { message },
        Err(e) if e.is_panic() => HandlerOutcome::Error {
            message: "handler panicked".to_string(),
        },
        Err(_) => HandlerOutcome::Cancelled,
    };
    lock(&running).remove(&call_id);
    let _ = outbox.send(GuestMessage::Result { call_id, outcome });
}

fn lock(running: &Running) -> std::sync::MutexGuard<'_, HashMap<u64, CancellationToken>> {
    running.lock().unwrap_or_else(|e| {
        tracing::warn!("running call table lock poisoned, recovering");
        e.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use plughost_core::{HookKind, HostCall, HostCallResult};
    use serde_json::{Value, json};

    use super::*;
    use crate::router::HandlerRouter;

    struct Harness {
        to_guest: mpsc::UnboundedSender<HostMessage>,
        from_guest: mpsc::UnboundedReceiver<GuestMessage>,
        task: tokio::task::JoinHandle<SdkResult<()>>,
    }

    fn start(guest: HandlerRouter) -> Harness {
        let (to_guest, inbox) = mpsc::unbounded_channel();
        let (outbox, from_guest) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(Arc::new(guest), inbox, outbox));
        Harness {
            to_guest,
            from_guest,
            task,
        }
    }

    fn invoke(call_id: u64, handler: &str) -> HostMessage {
        HostMessage::Invoke {
            call_id,
            hook: HookKind::OnJobReceived,
            handler: handler.into(),
            payload: json!({"n": call_id}),
        }
    }

    async fn next(h: &mut Harness) -> GuestMessage {
        tokio::time::timeout(Duration::from_secs(5), h.from_guest.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn ready_then_results() {
        let mut h = start(
            HandlerRouter::new().on("echo", |call, _ctx| async move { Ok(call.payload) }),
        );
        assert_eq!(
            next(&mut h).await,
            GuestMessage::Ready {
                protocol: PROTOCOL_VERSION
            }
        );

        h.to_guest.send(invoke(1, "echo")).unwrap();
        assert_eq!(
            next(&mut h).await,
            GuestMessage::Result {
                call_id: 1,
                outcome: HandlerOutcome::Ok {
                    value: json!({"n": 1})
                },
            }
        );

        h.to_guest.send(invoke(2, "missing")).unwrap();
        let GuestMessage::Result { outcome, .. } = next(&mut h).await else {
            panic!("expected result");
        };
        assert!(matches!(outcome, HandlerOutcome::Error { message } if message.contains("missing")));

        h.to_guest.send(HostMessage::Shutdown).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panic_becomes_error_outcome() {
        let mut h = start(HandlerRouter::new().on("boom", |call, _ctx| async move {
            assert!(call.payload.is_null(), "kaboom");
            Ok(Value::Null)
        }));
        next(&mut h).await;
        h.to_guest.send(invoke(7, "boom")).unwrap();
        let GuestMessage::Result { call_id, outcome } = next(&mut h).await else {
            panic!("expected result");
        };
        assert_eq!(call_id, 7);
        assert!(matches!(outcome, HandlerOutcome::Error { .. }));
    }

    #[tokio::test]
    async fn cancel_reaches_the_handler() {
        let mut h = start(HandlerRouter::new().on("wait", |_call, ctx| async move {
            ctx.cancelled().await;
            Err("stopped".to_string())
        }));
        next(&mut h).await;
        h.to_guest.send(invoke(3, "wait")).unwrap();
        h.to_guest.send(HostMessage::Cancel { call_id: 3 }).unwrap();
        assert_eq!(
            next(&mut h).await,
            GuestMessage::Result {
                call_id: 3,
                outcome: HandlerOutcome::Cancelled,
            }
        );
    }

    #[tokio::test]
    async fn host_calls_round_trip_through_the_loop() {
        let mut h = start(HandlerRouter::new().on("read", |_call, ctx| async move {
            match ctx.host().read_file("/data/in.txt").await {
                Ok(contents) => Ok(json!({ "read": contents })),
                Err(e) => Err(e.to_string()),
            }
        }));
        next(&mut h).await;
        h.to_guest.send(invoke(4, "read")).unwrap();

        let GuestMessage::HostCall { request_id, call } = next(&mut h).await else {
            panic!("expected host call");
        };
        assert_eq!(
            call,
            HostCall::FsRead {
                path: "/data/in.txt".into()
            }
        );
        h.to_guest
            .send(HostMessage::HostReply {
                request_id,
                result: HostCallResult::Ok {
                    value: json!({"contents": "abc"}),
                },
            })
            .unwrap();

        assert_eq!(
            next(&mut h).await,
            GuestMessage::Result {
                call_id: 4,
                outcome: HandlerOutcome::Ok {
                    value: json!({"read": "abc"})
                },
            }
        );
    }

    #[tokio::test]
    async fn closed_inbox_ends_the_loop() {
        let h = start(HandlerRouter::new());
        drop(h.to_guest);
        h.task.await.unwrap().unwrap();
    }
}
