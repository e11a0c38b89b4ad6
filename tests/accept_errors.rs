//! Runs in its own test binary because it lowers the process file limit.
#![cfg(target_os = "linux")]

use std::fs::File;
use std::os::fd::AsRawFd;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::client_async;

use ws_listener::config::Settings;
use ws_listener::connection::ConnectionEvent;
use ws_listener::server::{Server, ACCEPT_ERROR_PAUSE};

const WAIT: Duration = Duration::from_secs(5);

fn file_limit() -> libc::rlimit {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);
    limit
}

fn set_file_limit(limit: &libc::rlimit) {
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, limit) }, 0);
}

#[tokio::test]
async fn test_accept_errors_do_not_stop_the_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let server = Server::new(listener, Settings::default()).with_events(events_tx);
    let address = server.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));
    sleep(Duration::from_millis(50)).await;

    // Descriptors are allocated lowest-first, so everything below this one is taken.
    let next_fd = File::open("/dev/null").unwrap().as_raw_fd();
    let original = file_limit();
    set_file_limit(&libc::rlimit {
        rlim_cur: next_fd as libc::rlim_t + 1,
        rlim_max: original.rlim_max,
    });

    // The client takes the last descriptor, so every accept fails with EMFILE.
    let socket = TcpStream::connect(address).await;
    sleep(ACCEPT_ERROR_PAUSE * 3).await;
    set_file_limit(&original);
    let socket = socket.unwrap();

    let (_client, _) = client_async(format!("ws://{address}"), socket)
        .await
        .unwrap();
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind, ConnectionEvent::Connected);

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap();
}
