use std::time::Duration;

use labhal::{ConnectConfig, Connection, Error, TimeoutPolicy};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
};

/// Fake SCPI instrument answering `*IDN?` and `MEAS?`, ignoring everything
/// else. Replies are written in two pieces to exercise reassembly.
async fn fake_instrument() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (rx, mut tx) = stream.into_split();
                let mut lines = BufReader::new(rx).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply: &[u8] = match line.trim_end() {
                        "*IDN?" => b"ACME,DMM-1000,42,1.2\n",
                        "MEAS?" => b"+1.234E+00\n",
                        _ => continue,
                    };
                    let (a, b) = reply.split_at(reply.len() / 2);
                    tx.write_all(a).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    tx.write_all(b).await.unwrap();
                }
            });
        }
    });

    port
}

fn config(port: u16) -> ConnectConfig {
    ConnectConfig::socket("127.0.0.1", port).with_timeouts(TimeoutPolicy::new(
        Duration::from_secs(2),
        Duration::from_secs(2),
        Duration::from_millis(300),
    ))
}

#[tokio::test]
async fn query_over_socket() {
    let port = fake_instrument().await;
    let mut conn = Connection::from_config(&config(port)).unwrap();
    assert_eq!(conn.describe(), format!("socket:127.0.0.1:{port}"));

    conn.open().await.unwrap();
    assert_eq!(conn.query(b"*IDN?").await.unwrap(), b"ACME,DMM-1000,42,1.2");
    assert_eq!(conn.query(b"MEAS?").await.unwrap(), b"+1.234E+00");

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    assert!(matches!(conn.query(b"MEAS?").await, Err(Error::NotOpen)));
}

#[tokio::test]
async fn recovers_from_receive_timeout() {
    let port = fake_instrument().await;
    let mut conn = Connection::from_config(&config(port)).unwrap();
    conn.open().await.unwrap();

    /* Instrument stays silent for commands it does not know */
    let res = conn.query(b"OUTP ON").await;
    assert!(matches!(res, Err(Error::ReceiveTimeout { .. })));

    conn.close().await.unwrap();
    conn.open().await.unwrap();
    assert_eq!(conn.query(b"MEAS?").await.unwrap(), b"+1.234E+00");
}

#[tokio::test]
async fn peer_closing_is_a_read_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"partial").await.unwrap();
    });

    let mut conn = Connection::from_config(&config(port)).unwrap();
    conn.open().await.unwrap();
    assert!(matches!(conn.recv().await, Err(Error::Read(_))));
}

#[tokio::test]
async fn refused_connection() {
    /* Grab a free port and release it again */
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut conn = Connection::from_config(&config(port)).unwrap();
    assert!(matches!(conn.open().await, Err(Error::Connect(_))));
    assert!(!conn.is_open());
}
