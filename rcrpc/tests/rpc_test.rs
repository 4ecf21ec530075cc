//! Raw call layer integration tests.
//!
//! Run with:
//! ```bash
//! cargo test --package rcrpc --test rpc_test -- --nocapture
//! ```

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use common::{HOST, TestContext, TestServer, conn_config, connect_pair, echo, open_pd};
use rcrpc::verbs::{AccessFlags, WcStatus};
use rcrpc::{
    Acceptor, Client, ClientMux, Connector, Endpoint, Error, Handshake, HandlerRegistry,
    RpcConfig, Server,
};

const ECHO: u32 = 1;
const REVERSE: u32 = 2;
const BIG: u32 = 3;

fn reverse(request: &[u8], response: &mut [u8]) -> usize {
    for (dst, src) in response.iter_mut().zip(request.iter().rev()) {
        *dst = *src;
    }
    request.len()
}

/// Establish `count` endpoint pairs over one bootstrap connection.
async fn connect_multiple(
    rpc: &RpcConfig,
    handshake: Handshake,
) -> (Vec<Endpoint>, Vec<Endpoint>, Handshake) {
    let conn = conn_config(rpc);
    let acceptor = Acceptor::new(0, open_pd(), conn);
    let port = acceptor.local_addr().port();
    let connector = Connector::new(open_pd(), conn);

    let (client_side, accepted) = tokio::join!(
        connector.connect_multiple(HOST, port, &handshake),
        acceptor.accept_multiple()
    );
    let (server_side, received) = accepted.expect("accept_multiple");
    (client_side.expect("connect_multiple"), server_side, received)
}

// =============================================================================
// Round Trip
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_trip() {
    let ctx = TestContext::new(RpcConfig::default(), 2, |registry| {
        registry.register_handler(ECHO, echo);
        registry.register_handler(REVERSE, reverse);
    })
    .await;

    let mut response = vec![0u8; 4096];
    for len in [0usize, 1, 17, 1000, 4096] {
        let request: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let n = ctx.client.call(ECHO, &request, &mut response).await.unwrap();
        assert_eq!(n, len);
        assert_eq!(&response[..n], &request[..]);

        let n = ctx.client.call(REVERSE, &request, &mut response).await.unwrap();
        let expected: Vec<u8> = request.iter().rev().copied().collect();
        assert_eq!(&response[..n], &expected[..]);
    }

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_callers() {
    let rpc = RpcConfig::default().with_max_inflight(8);
    let TestContext { client, server } = TestContext::new(rpc, 4, |registry| {
        registry.register_handler(ECHO, echo);
    })
    .await;
    let client = Arc::new(client);

    let mut tasks = Vec::new();
    for task in 0..32u32 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let mut response = [0u8; 64];
            for i in 0..50u32 {
                let request = [task.to_le_bytes(), i.to_le_bytes()].concat();
                let n = client.call(ECHO, &request, &mut response).await.unwrap();
                assert_eq!(&response[..n], &request[..]);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(client.available_slots(), 8);

    server.stop().await.unwrap();
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_id_returns_empty_response() {
    let ctx = TestContext::new(RpcConfig::default(), 1, |registry| {
        registry.register_handler(ECHO, echo);
    })
    .await;

    let mut response = [0u8; 16];
    let n = ctx.client.call(0xdead_beef, b"who", &mut response).await.unwrap();
    assert_eq!(n, 0);

    // The worker is still serving.
    let n = ctx.client.call(ECHO, b"ping", &mut response).await.unwrap();
    assert_eq!(&response[..n], b"ping");

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_too_large() {
    let rpc = RpcConfig::default().with_max_request_payload(16);
    let ctx = TestContext::new(rpc, 1, |registry| {
        registry.register_handler(ECHO, echo);
    })
    .await;

    let mut response = [0u8; 32];
    let err = ctx.client.call(ECHO, &[0u8; 17], &mut response).await.unwrap_err();
    assert!(matches!(err, Error::RequestTooLarge { len: 17, max: 16 }));

    let n = ctx.client.call(ECHO, &[7u8; 16], &mut response).await.unwrap();
    assert_eq!(n, 16);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_response_too_large_keeps_connection() {
    let ctx = TestContext::new(RpcConfig::default(), 1, |registry| {
        registry.register_handler(ECHO, echo);
        registry.register_handler(BIG, |_, response| {
            response[..64].fill(0xab);
            64
        });
    })
    .await;

    let mut small = [0u8; 8];
    let err = ctx.client.call(BIG, b"", &mut small).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ResponseTooLarge {
            len: 64,
            capacity: 8
        }
    ));

    let mut response = [0u8; 64];
    let n = ctx.client.call(BIG, b"", &mut response).await.unwrap();
    assert_eq!(response[..n], [0xab; 64]);
    let n = ctx.client.call(ECHO, b"still here", &mut response).await.unwrap();
    assert_eq!(&response[..n], b"still here");

    ctx.shutdown().await;
}

// =============================================================================
// Flow Control
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inflight_bound() {
    let invoked = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicBool::new(false));
    let rpc = RpcConfig::default().with_max_inflight(2);

    let ctx = {
        let invoked = Arc::clone(&invoked);
        let released = Arc::clone(&released);
        TestContext::new(rpc, 2, move |registry| {
            registry.register_handler(ECHO, move |request, response| {
                invoked.fetch_add(1, Ordering::SeqCst);
                while !released.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                echo(request, response)
            });
        })
        .await
    };

    let finished = AtomicUsize::new(0);
    let call = |tag: u8| {
        let client = &ctx.client;
        let finished = &finished;
        async move {
            let mut response = [0u8; 4];
            let n = client.call(ECHO, &[tag], &mut response).await.unwrap();
            finished.fetch_add(1, Ordering::SeqCst);
            assert_eq!(&response[..n], &[tag]);
        }
    };
    let probe = async {
        while invoked.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Two calls hold both slots; the third is still waiting for one.
        assert_eq!(invoked.load(Ordering::SeqCst), 2);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.client.available_slots(), 0);
        released.store(true, Ordering::SeqCst);
    };

    tokio::join!(call(1), call(2), call(3), probe);
    assert_eq!(invoked.load(Ordering::SeqCst), 3);
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.client.available_slots(), 2);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_call_releases_slot_on_late_response() {
    let released = Arc::new(AtomicBool::new(false));
    let rpc = RpcConfig::default().with_max_inflight(1);

    let ctx = {
        let released = Arc::clone(&released);
        TestContext::new(rpc, 1, move |registry| {
            registry.register_handler(ECHO, move |request, response| {
                if request == b"first" {
                    while !released.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                echo(request, response)
            });
        })
        .await
    };

    let mut response = [0u8; 16];
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        ctx.client.call(ECHO, b"first", &mut response),
    )
    .await;
    assert!(abandoned.is_err());
    // The slot stays held until the server answers.
    assert_eq!(ctx.client.available_slots(), 0);

    released.store(true, Ordering::SeqCst);
    let n = ctx.client.call(ECHO, b"second", &mut response).await.unwrap();
    assert_eq!(&response[..n], b"second");
    assert_eq!(ctx.client.available_slots(), 1);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_send_releases_slot() {
    let rpc = RpcConfig::default().with_max_inflight(1);
    let (client_side, server_side) = connect_pair(&rpc).await;

    // The peer only offers receives too small for the request.
    let mut landing = vec![0u8; 8].into_boxed_slice();
    let mr = unsafe {
        server_side
            .pd()
            .register(landing.as_mut_ptr(), landing.len(), AccessFlags::LOCAL_WRITE)
    }
    .unwrap();
    server_side.post_recv(0, &mr, 0, landing.len()).unwrap();
    server_side.post_recv(1, &mr, 0, landing.len()).unwrap();

    let client = Client::new(client_side, rpc).unwrap();
    let mut response = [0u8; 16];
    for _ in 0..2 {
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            client.call(ECHO, &[0u8; 64], &mut response),
        )
        .await
        .expect("call returns")
        .unwrap_err();
        assert!(
            matches!(
                err,
                Error::Completion {
                    status: WcStatus::RemInvReqErr,
                    ..
                }
            ),
            "got {err:?}"
        );
        assert_eq!(client.available_slots(), 1);
    }
}

// =============================================================================
// Connection Lifecycle
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_after_server_gone() {
    let TestContext { client, server } = TestContext::new(RpcConfig::default(), 1, |registry| {
        registry.register_handler(ECHO, echo);
    })
    .await;

    server.stop().await.unwrap();

    let mut response = [0u8; 16];
    let err = client.call(ECHO, b"anyone?", &mut response).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_run_ends_when_client_leaves() {
    let TestContext { client, server } = TestContext::new(RpcConfig::default(), 2, |registry| {
        registry.register_handler(ECHO, echo);
    })
    .await;

    let mut response = [0u8; 4];
    client.call(ECHO, b"bye", &mut response).await.unwrap();
    drop(client);

    let err = server.join().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_user_data_reaches_acceptor_and_is_echoed() {
    let rpc = RpcConfig::default();
    let acceptor = Acceptor::new(0, open_pd(), conn_config(&rpc));
    let port = acceptor.local_addr().port();
    let connector = Connector::new(open_pd(), conn_config(&rpc));

    let (client_side, server_side) = tokio::join!(
        connector.connect(HOST, port, b"tenant-7"),
        acceptor.accept()
    );
    let (client_side, server_side) = (client_side.unwrap(), server_side.unwrap());
    assert_eq!(server_side.user_data(), b"tenant-7");
    assert_eq!(client_side.user_data(), b"tenant-7");
    assert_eq!(server_side.session_id(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_acceptor_close() {
    let rpc = RpcConfig::default();
    let acceptor = Arc::new(Acceptor::new(0, open_pd(), conn_config(&rpc)));

    let pending = {
        let acceptor = Arc::clone(&acceptor);
        tokio::spawn(async move { acceptor.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    acceptor.close();

    assert!(matches!(pending.await.unwrap(), Err(Error::Closed)));
    assert!(matches!(acceptor.accept_multiple().await, Err(Error::Closed)));
}

// =============================================================================
// Multi-Endpoint Handshake
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multi_endpoint_handshake() {
    const SESSION: u64 = 0x5e55_1011;
    let rpc = RpcConfig::default().with_max_inflight(4);

    let (client_side, server_side, received) =
        connect_multiple(&rpc, Handshake::new(3, SESSION)).await;

    assert_eq!(client_side.len(), 3);
    assert_eq!(server_side.len(), 3);
    assert_eq!(received, Handshake::new(3, SESSION));
    for endpoint in client_side.iter().chain(server_side.iter()) {
        assert_eq!(endpoint.session_id(), Some(SESSION));
        assert!(endpoint.config().shared_cq);
    }

    // Endpoint k of one side is connected to endpoint k of the other.
    let mut servers = Vec::new();
    for (k, endpoint) in server_side.into_iter().enumerate() {
        let server = Server::new(endpoint, rpc, Arc::new(HandlerRegistry::new()), 1).unwrap();
        server.register_handler(ECHO, move |_, response| {
            response[0] = k as u8;
            1
        });
        servers.push(TestServer::spawn(server));
    }
    let mut clients = Vec::new();
    for (k, endpoint) in client_side.into_iter().enumerate() {
        let client = Client::new(endpoint, rpc).unwrap();
        let mut response = [0u8; 1];
        client.call(ECHO, b"", &mut response).await.unwrap();
        assert_eq!(response[0], k as u8);
        clients.push(client);
    }

    for server in servers {
        server.stop().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_endpoint_handshake_rejected() {
    let rpc = RpcConfig::default();
    let acceptor = Acceptor::new(0, open_pd(), conn_config(&rpc));
    let port = acceptor.local_addr().port();

    let connector = Connector::new(open_pd(), conn_config(&rpc));
    let err = connector
        .connect_multiple(HOST, port, &Handshake::new(0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Handshake(_)));

    // A peer that sends the record anyway is refused by the acceptor.
    let (_, accepted) = tokio::join!(
        async {
            let mut stream = tokio::net::TcpStream::connect((HOST, port)).await.unwrap();
            rcrpc::handshake::send_handshake(&mut stream, &Handshake::new(0, 1))
                .await
                .unwrap();
            stream
        },
        acceptor.accept_multiple()
    );
    assert!(matches!(accepted, Err(Error::Handshake(_))));
}

// =============================================================================
// Client Multiplexer
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_mux_round_robin() {
    const CONNECTIONS: usize = 4;
    const CALLS: usize = 4000;
    let rpc = RpcConfig::default().with_max_inflight(8);

    let (client_side, server_side, _) =
        connect_multiple(&rpc, Handshake::new(CONNECTIONS as u32, 42)).await;

    let mut servers = Vec::new();
    for (k, endpoint) in server_side.into_iter().enumerate() {
        let server = Server::new(endpoint, rpc, Arc::new(HandlerRegistry::new()), 1).unwrap();
        server.register_handler(ECHO, move |_, response| {
            response[0] = k as u8;
            1
        });
        servers.push(TestServer::spawn(server));
    }

    let mux = ClientMux::from_endpoints(client_side, rpc).unwrap();
    assert_eq!(mux.len(), CONNECTIONS);

    let mut per_connection = [0usize; CONNECTIONS];
    let mut response = [0u8; 1];
    for i in 0..CALLS {
        mux.call(ECHO, b"", &mut response).await.unwrap();
        let k = response[0] as usize;
        assert_eq!(k, i % CONNECTIONS);
        per_connection[k] += 1;
    }
    assert_eq!(per_connection, [CALLS / CONNECTIONS; CONNECTIONS]);

    for server in servers {
        server.stop().await.unwrap();
    }
}
