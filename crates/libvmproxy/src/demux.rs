use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use vmproxy_protocol::{Frame, Notification, Stream};

use crate::guest::{GuestTransport, IoMessage};
use crate::registry::SessionRegistry;
use crate::session::IoSession;

/// Frame a guest message for the session's client. Returns `None` for the
/// empty EOF marker, which only flips the session to terminated.
pub(crate) async fn frame_for_message(session: &IoSession, msg: IoMessage) -> Option<Frame> {
    if msg.payload.is_empty() {
        session.mark_terminated().await;
        return None;
    }

    if msg.payload.len() == 1 && session.is_terminated().await {
        return Some(Frame::notification(
            Notification::ProcessExited,
            msg.payload,
        ));
    }

    let stream = if msg.seq == session.io_base() {
        Stream::Stdout
    } else {
        Stream::Stderr
    };
    Some(Frame::stream(stream, msg.payload))
}

/// Route every guest I/O message to the client of the session owning its
/// sequence number. Runs until the transport fails, then fires `lost`.
pub async fn run(
    vm_id: String,
    guest: Arc<dyn GuestTransport>,
    registry: Arc<SessionRegistry>,
    lost: Arc<watch::Sender<bool>>,
) {
    loop {
        let msg = match guest.read_io().await {
            Ok(msg) => msg,
            Err(e) => {
                info!(vm = %vm_id, error = %e, "guest io channel closed");
                break;
            }
        };

        let Some(session) = registry.find_by_sequence(msg.seq).await else {
            warn!(vm = %vm_id, seq = msg.seq, "no session for guest io message");
            continue;
        };

        if session.is_null() {
            debug!(
                vm = %vm_id,
                seq = msg.seq,
                data = %hex::encode(&msg.payload),
                "discarding output for null session"
            );
            continue;
        }

        trace!(vm = %vm_id, seq = msg.seq, len = msg.payload.len(), "guest io");
        let seq = msg.seq;
        let Some(frame) = frame_for_message(&session, msg).await else {
            continue;
        };

        let Some(client) = session.client().await else {
            warn!(vm = %vm_id, seq, "dropping guest output, no shim attached");
            continue;
        };
        if let Err(e) = client.send(frame).await {
            warn!(vm = %vm_id, seq, client = client.id(), error = %e, "failed to deliver guest output");
        }
    }

    lost.send_replace(true);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use vmproxy_protocol::FrameType;

    use super::*;
    use crate::config::EngineConfig;
    use crate::guest::memory::MemoryTransport;
    use crate::session::{ClientHandle, FIRST_IO_BASE, NULL_SESSION_STDOUT};

    struct Fixture {
        guest: crate::guest::memory::MemoryGuest,
        registry: Arc<SessionRegistry>,
        lost: watch::Receiver<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Fixture {
        let (transport, guest) = MemoryTransport::pair();
        let transport: Arc<dyn GuestTransport> = Arc::new(transport);
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&transport),
            EngineConfig::default(),
        ));
        let (lost_tx, lost) = watch::channel(false);
        let task = tokio::spawn(run(
            "vm".to_string(),
            transport,
            Arc::clone(&registry),
            Arc::new(lost_tx),
        ));
        Fixture {
            guest,
            registry,
            lost,
            task,
        }
    }

    async fn attach(registry: &SessionRegistry) -> (Arc<IoSession>, mpsc::Receiver<Frame>) {
        let token = registry.allocate_token().await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        let (client, _closed) = ClientHandle::new(1, tx);
        let session = registry.attach_client(&token, client).await.unwrap();
        (session, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn routes_stdout_and_stderr_by_sequence() {
        let fx = start();
        let (session, mut rx) = attach(&fx.registry).await;
        assert_eq!(session.io_base(), FIRST_IO_BASE);

        fx.guest.send(FIRST_IO_BASE, b"out".to_vec());
        fx.guest.send(FIRST_IO_BASE + 1, b"err".to_vec());

        let out = next(&mut rx).await;
        assert_eq!(out.stream_opcode(), Some(Stream::Stdout));
        assert_eq!(out.payload, b"out");
        let err = next(&mut rx).await;
        assert_eq!(err.stream_opcode(), Some(Stream::Stderr));
        assert_eq!(err.payload, b"err");
    }

    #[tokio::test]
    async fn eof_then_status_becomes_exit_notification() {
        let fx = start();
        let (session, mut rx) = attach(&fx.registry).await;

        fx.guest.send(FIRST_IO_BASE, Vec::<u8>::new());
        fx.guest.send(FIRST_IO_BASE, vec![42]);

        let frame = next(&mut rx).await;
        assert_eq!(frame.frame_type(), FrameType::Notification);
        assert_eq!(
            frame.notification_opcode(),
            Some(Notification::ProcessExited)
        );
        assert_eq!(frame.payload, vec![42]);
        assert!(session.is_terminated().await);
    }

    #[tokio::test]
    async fn single_byte_before_eof_is_stream_data() {
        let fx = start();
        let (_session, mut rx) = attach(&fx.registry).await;
        fx.guest.send(FIRST_IO_BASE, b"x".to_vec());
        let frame = next(&mut rx).await;
        assert_eq!(frame.stream_opcode(), Some(Stream::Stdout));
    }

    #[tokio::test]
    async fn unknown_and_null_sequences_do_not_stop_the_loop() {
        let fx = start();
        let (_session, mut rx) = attach(&fx.registry).await;

        fx.guest.send(999, b"stray".to_vec());
        fx.guest.send(NULL_SESSION_STDOUT, b"discard".to_vec());
        fx.guest.send(FIRST_IO_BASE, b"after".to_vec());

        let frame = next(&mut rx).await;
        assert_eq!(frame.payload, b"after");
        assert!(!*fx.lost.borrow());
    }

    #[tokio::test]
    async fn dead_client_does_not_stop_the_loop() {
        let fx = start();
        let (_first, rx) = attach(&fx.registry).await;
        drop(rx);
        let (second, mut rx2) = attach(&fx.registry).await;

        fx.guest.send(FIRST_IO_BASE, b"lost".to_vec());
        fx.guest.send(second.io_base(), b"kept".to_vec());

        let frame = next(&mut rx2).await;
        assert_eq!(frame.payload, b"kept");
    }

    #[tokio::test]
    async fn transport_failure_fires_lost() {
        let mut fx = start();
        let (_session, _rx) = attach(&fx.registry).await;
        fx.guest.disconnect();

        let mut lost = fx.lost.clone();
        tokio::time::timeout(Duration::from_secs(2), lost.wait_for(|l| *l))
            .await
            .unwrap()
            .unwrap();
        fx.task.await.unwrap();
        // sessions stay in place until the vm is closed
        assert_eq!(fx.registry.len().await, 1);
    }
}
