//! Connection link behaviour against bare WebSocket servers.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tether_client::{ConnectionLink, ConnectionStatus, LinkConfig, StaticPort};
use tether_core::protocol::ServerFrame;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

/// How a test server treats each accepted connection.
#[derive(Clone, Copy)]
enum Behaviour {
    /// Read and ignore everything, never answering pings.
    Silent,
    /// Close the first connection right away, keep later ones open.
    DropFirst,
    /// Send this many requests as fast as possible, then go silent.
    Burst(usize),
}

/// Spawn a WebSocket server; returns its port and an accepted-connection count.
async fn spawn_server(behaviour: Behaviour) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    let _ = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                match behaviour {
                    Behaviour::DropFirst if n == 1 => {
                        let _ = ws.close(None).await;
                        return;
                    }
                    Behaviour::Burst(count) => {
                        for i in 0..count {
                            let frame = format!(
                                r#"{{"id":"req_{i}","action":"echo","payload":{{}}}}"#
                            );
                            if ws.send(Message::text(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ => {}
                }
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    (port, accepted)
}

fn fast_config() -> LinkConfig {
    LinkConfig {
        reconnect_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(50),
        connection_timeout: Duration::from_secs(2),
        ..LinkConfig::default()
    }
}

async fn wait_for(rx: &mut broadcast::Receiver<ConnectionStatus>, want: ConnectionStatus) {
    timeout(TIMEOUT, async {
        loop {
            if rx.recv().await.unwrap() == want {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {want}"));
}

#[tokio::test]
async fn missing_pong_forces_reconnect() {
    let (port, _) = spawn_server(Behaviour::Silent).await;
    let config = LinkConfig {
        reconnect_interval: Duration::from_secs(30),
        ..fast_config()
    };
    let link = ConnectionLink::new(config, Arc::new(StaticPort(port)));
    let mut status = link.subscribe_status();

    link.connect().await.unwrap();
    assert!(link.is_connected());
    // The peer never closes; only the heartbeat can notice it is dead.
    wait_for(&mut status, ConnectionStatus::Reconnecting).await;
    assert!(!link.is_connected());
    link.disconnect();
}

#[tokio::test]
async fn reconnects_after_server_closes() {
    let (port, accepted) = spawn_server(Behaviour::DropFirst).await;
    let link = ConnectionLink::new(
        LinkConfig {
            heartbeat_interval: Duration::from_secs(20),
            ..fast_config()
        },
        Arc::new(StaticPort(port)),
    );
    let mut status = link.subscribe_status();

    link.connect().await.unwrap();
    wait_for(&mut status, ConnectionStatus::Connected).await;
    wait_for(&mut status, ConnectionStatus::Reconnecting).await;
    wait_for(&mut status, ConnectionStatus::Connected).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    link.disconnect();
}

#[tokio::test]
async fn refused_connection_enters_error_then_retries() {
    // Bind and drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let link = ConnectionLink::new(fast_config(), Arc::new(StaticPort(port)));
    let mut status = link.subscribe_status();

    assert!(link.connect().await.is_err());
    wait_for(&mut status, ConnectionStatus::Error).await;
    wait_for(&mut status, ConnectionStatus::Reconnecting).await;
    wait_for(&mut status, ConnectionStatus::Connecting).await;
    link.disconnect();
    assert_eq!(link.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn disconnect_is_terminal() {
    let (port, accepted) = spawn_server(Behaviour::Silent).await;
    let link = ConnectionLink::new(fast_config(), Arc::new(StaticPort(port)));

    link.connect().await.unwrap();
    link.disconnect();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(link.status(), ConnectionStatus::Disconnected);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(link.send("{}".into()).is_err());
}

#[tokio::test]
async fn claimed_frames_survive_a_slow_consumer() {
    // More than the broadcast buffer holds.
    const COUNT: usize = 1_500;
    let (port, _) = spawn_server(Behaviour::Burst(COUNT)).await;
    let link = ConnectionLink::new(
        LinkConfig {
            heartbeat_interval: Duration::from_secs(20),
            ..fast_config()
        },
        Arc::new(StaticPort(port)),
    );
    let mut frames = link.claim_frames(8);
    let mut observer = link.subscribe_messages();

    link.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 0..COUNT {
        let frame = timeout(TIMEOUT, frames.recv()).await.unwrap().unwrap();
        match frame {
            Ok(ServerFrame::Request(req)) => assert_eq!(req.id.to_string(), format!("req_{i}")),
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert!(link.is_connected());
    // The broadcast observer was never drained and has fallen behind.
    assert!(matches!(
        observer.recv().await,
        Err(broadcast::error::RecvError::Lagged(_))
    ));
    link.disconnect();
}
