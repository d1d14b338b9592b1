//! Integration tests for nx-proxy
//!
//! Covers the cross-module flows:
//! - slot peer reconciliation and byte-delta capture
//! - credential rotation tearing down live connections
//! - the SOCKS5 handshake byte exchange
//! - HTTP proxy authentication responses
//! - service hub reconciliation across configs

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use nx_proxy::hub::{ServiceHub, ServiceOptions, SlotService};
use nx_proxy::net::DnsHandle;
use nx_proxy::peer::{PeerError, PeerOptions, UserPassword};
use nx_proxy::slot::{AuthError, ProxyProto, Slot, SlotOptions};
use nx_proxy::socks5::Socks5Service;
use nx_proxy::http::HttpService;

const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

fn slot_opts(proto: ProxyProto, bind_addr: &str) -> SlotOptions {
    SlotOptions {
        id: Uuid::new_v4(),
        proto,
        bind_addr: bind_addr.to_string(),
    }
}

fn peer_opts(id: &str, user: &str, password: &str) -> PeerOptions {
    PeerOptions {
        id: Uuid::parse_str(id).expect("peer id"),
        password_auth: Some(UserPassword {
            user: user.to_string(),
            password: password.to_string(),
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_slot_peer_import() {
    let slot = Slot::new(slot_opts(ProxyProto::Socks, "127.0.0.1:0"), DnsHandle::new());

    slot.set_peers(vec![
        peer_opts("b9cfd40e-255c-4101-85b9-73ab9efb509f", "maddsua", "test123"),
        peer_opts("c0db0438-4d76-4c53-83f1-81fe053e0102", "someoneelse", "88888888888"),
    ]);

    let persisted = slot
        .lookup_with_password(CLIENT_IP, "maddsua", "test123")
        .expect("lookup maddsua");
    let ephemeral = slot
        .lookup_with_password(CLIENT_IP, "someoneelse", "88888888888")
        .expect("lookup someoneelse");

    slot.set_peers(vec![peer_opts(
        "b9cfd40e-255c-4101-85b9-73ab9efb509f",
        "maddsua",
        "test123",
    )]);

    match slot.lookup_with_password(CLIENT_IP, "someoneelse", "88888888888") {
        Err(AuthError::UserNotFound) => {}
        other => panic!("unexpected lookup result: {other:?}"),
    }

    assert!(persisted.connection().is_ok());
    assert_eq!(ephemeral.connection().unwrap_err(), PeerError::PeerClosed);
}

#[tokio::test]
async fn test_slot_auth_rejections() {
    let slot = Slot::new(slot_opts(ProxyProto::Socks, "127.0.0.1:0"), DnsHandle::new());

    slot.set_peers(vec![peer_opts(
        "b9cfd40e-255c-4101-85b9-73ab9efb509f",
        "maddsua",
        "test123",
    )]);

    match slot.lookup_with_password(CLIENT_IP, "maddsua", "wrong") {
        Err(AuthError::InvalidPassword(user)) => assert_eq!(user, "maddsua"),
        other => panic!("unexpected lookup result: {other:?}"),
    }

    match slot.lookup_with_password(CLIENT_IP, "nobody", "test123") {
        Err(AuthError::UserNotFound) => {}
        other => panic!("unexpected lookup result: {other:?}"),
    }
}

#[tokio::test]
async fn test_slot_skips_invalid_peer_entries() {
    let slot = Slot::new(slot_opts(ProxyProto::Socks, "127.0.0.1:0"), DnsHandle::new());

    let valid = peer_opts("b9cfd40e-255c-4101-85b9-73ab9efb509f", "maddsua", "test123");

    // nil id
    let mut nil_id = peer_opts("c0db0438-4d76-4c53-83f1-81fe053e0102", "other", "pass");
    nil_id.id = Uuid::nil();

    // no auth
    let no_auth = PeerOptions {
        id: Uuid::new_v4(),
        ..Default::default()
    };

    // duplicate username
    let dup_user = peer_opts("3e0e7056-8ded-4546-99f0-1b0c9014773d", "maddsua", "another");

    slot.set_peers(vec![valid, nil_id, no_auth, dup_user]);

    assert_eq!(slot.info(true).registered_peers, 1);
    assert!(slot.lookup_with_password(CLIENT_IP, "maddsua", "test123").is_ok());
}

#[tokio::test]
async fn test_slot_deltas_survive_peer_removal() {
    let slot = Slot::new(slot_opts(ProxyProto::Socks, "127.0.0.1:0"), DnsHandle::new());

    slot.set_peers(vec![
        peer_opts("4f33d96b-3f6e-4d29-8936-0e0490c44d93", "maddsua", "test123"),
        peer_opts("6018594e-6eee-4de8-86dc-33247142204f", "notmaddsua", "00000000"),
        peer_opts("3e0e7056-8ded-4546-99f0-1b0c9014773d", "someone_else", "123456"),
    ]);

    // a finished connection on the peer that stays
    let staying = slot
        .lookup_with_password(CLIENT_IP, "maddsua", "test123")
        .expect("lookup maddsua");
    let conn = staying.connection().expect("connection");
    conn.account_rx(2_000);
    conn.account_tx(1_000);
    conn.close();
    staying.refresh_state();

    // a live connection on the peer about to be dropped
    let leaving = slot
        .lookup_with_password(CLIENT_IP, "notmaddsua", "00000000")
        .expect("lookup notmaddsua");
    let conn = leaving.connection().expect("connection");
    conn.account_rx(852_000);
    conn.account_tx(25_000);

    slot.set_peers(vec![peer_opts(
        "4f33d96b-3f6e-4d29-8936-0e0490c44d93",
        "maddsua",
        "test123",
    )]);

    let deltas = slot.deltas();
    assert_eq!(deltas.len(), 2, "unexpected delta list: {deltas:?}");

    for entry in &deltas {
        match entry.peer_id.to_string().as_str() {
            "4f33d96b-3f6e-4d29-8936-0e0490c44d93" => {
                assert_eq!((entry.rx, entry.tx), (2_000, 1_000));
            }
            "6018594e-6eee-4de8-86dc-33247142204f" => {
                assert_eq!((entry.rx, entry.tx), (852_000, 25_000));
            }
            other => panic!("unexpected peer id: {other}"),
        }
    }

    // every byte is reported exactly once
    assert!(slot.deltas().is_empty());
}

#[tokio::test]
async fn test_credential_rotation_cancels_connections() {
    let slot = Slot::new(slot_opts(ProxyProto::Socks, "127.0.0.1:0"), DnsHandle::new());

    slot.set_peers(vec![peer_opts(
        "b9cfd40e-255c-4101-85b9-73ab9efb509f",
        "maddsua",
        "test123",
    )]);

    let peer = slot
        .lookup_with_password(CLIENT_IP, "maddsua", "test123")
        .expect("lookup");
    let conn = peer.connection().expect("connection");

    slot.set_peers(vec![peer_opts(
        "b9cfd40e-255c-4101-85b9-73ab9efb509f",
        "maddsua",
        "rotated456",
    )]);

    assert!(conn.is_closed(), "old connections must be cancelled");

    assert!(matches!(
        slot.lookup_with_password(CLIENT_IP, "maddsua", "test123"),
        Err(AuthError::InvalidPassword(_)),
    ));
    assert!(slot
        .lookup_with_password(CLIENT_IP, "maddsua", "rotated456")
        .is_ok());
}

#[tokio::test]
async fn test_close_peer_connections_keeps_peers() {
    let slot = Slot::new(slot_opts(ProxyProto::Socks, "127.0.0.1:0"), DnsHandle::new());

    slot.set_peers(vec![peer_opts(
        "b9cfd40e-255c-4101-85b9-73ab9efb509f",
        "maddsua",
        "test123",
    )]);

    let peer = slot
        .lookup_with_password(CLIENT_IP, "maddsua", "test123")
        .expect("lookup");
    let conn = peer.connection().expect("connection");
    conn.account_rx(64);

    slot.close_peer_connections();

    assert!(conn.is_closed());

    // the peer survives with its byte counts intact
    assert!(slot.lookup_with_password(CLIENT_IP, "maddsua", "test123").is_ok());
    let deltas = slot.deltas();
    assert_eq!(deltas.len(), 1);
    assert_eq!((deltas[0].rx, deltas[0].tx), (64, 0));
}

#[tokio::test]
async fn test_disabling_peer_cancels_connections() {
    let slot = Slot::new(slot_opts(ProxyProto::Socks, "127.0.0.1:0"), DnsHandle::new());

    slot.set_peers(vec![peer_opts(
        "b9cfd40e-255c-4101-85b9-73ab9efb509f",
        "maddsua",
        "test123",
    )]);

    let peer = slot
        .lookup_with_password(CLIENT_IP, "maddsua", "test123")
        .expect("lookup");
    let conn = peer.connection().expect("connection");

    let mut disabled = peer_opts("b9cfd40e-255c-4101-85b9-73ab9efb509f", "maddsua", "test123");
    disabled.disabled = true;
    slot.set_peers(vec![disabled]);

    assert!(conn.is_closed());
    assert!(peer.is_disabled());
}

#[tokio::test]
async fn test_socks5_handshake() {
    let service = Socks5Service::bind(
        slot_opts(ProxyProto::Socks, "127.0.0.1:0"),
        DnsHandle::new(),
    )
    .await
    .expect("bind service");

    service.set_peers(vec![peer_opts(
        "b9cfd40e-255c-4101-85b9-73ab9efb509f",
        "maddsua",
        "test123",
    )]);

    // valid credentials
    let mut conn = TcpStream::connect(service.local_addr()).await.unwrap();

    conn.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut buff = [0u8; 2];
    conn.read_exact(&mut buff).await.unwrap();
    assert_eq!(buff, [0x05, 0x02]);

    let mut frame = vec![0x01, 7];
    frame.extend_from_slice(b"maddsua");
    frame.push(7);
    frame.extend_from_slice(b"test123");
    conn.write_all(&frame).await.unwrap();

    conn.read_exact(&mut buff).await.unwrap();
    assert_eq!(buff, [0x01, 0x00]);

    // invalid credentials on a fresh connection
    let mut conn = TcpStream::connect(service.local_addr()).await.unwrap();

    conn.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    conn.read_exact(&mut buff).await.unwrap();
    assert_eq!(buff, [0x05, 0x02]);

    let mut frame = vec![0x01, 7];
    frame.extend_from_slice(b"maddsua");
    frame.push(8);
    frame.extend_from_slice(b"wrong123");
    conn.write_all(&frame).await.unwrap();

    conn.read_exact(&mut buff).await.unwrap();
    assert_eq!(buff, [0x01, 0x01]);

    // the server hangs up after a failed auth
    assert_eq!(conn.read(&mut buff).await.unwrap(), 0);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_socks5_rejects_unsupported_auth() {
    let service = Socks5Service::bind(
        slot_opts(ProxyProto::Socks, "127.0.0.1:0"),
        DnsHandle::new(),
    )
    .await
    .expect("bind service");

    let mut conn = TcpStream::connect(service.local_addr()).await.unwrap();

    // offers no-auth only
    conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

    let mut buff = [0u8; 2];
    conn.read_exact(&mut buff).await.unwrap();
    assert_eq!(buff, [0x05, 0xFF]);

    service.close().await.unwrap();
}

async fn read_response_string(conn: &mut TcpStream) -> String {
    let mut buff = Vec::new();
    conn.read_to_end(&mut buff).await.unwrap();
    String::from_utf8_lossy(&buff).to_string()
}

#[tokio::test]
async fn test_http_proxy_auth() {
    let service = HttpService::bind(
        slot_opts(ProxyProto::Http, "127.0.0.1:0"),
        DnsHandle::new(),
    )
    .await
    .expect("bind service");

    service.set_peers(vec![peer_opts(
        "b9cfd40e-255c-4101-85b9-73ab9efb509f",
        "maddsua",
        "test123",
    )]);

    // no credentials at all
    let mut conn = TcpStream::connect(service.local_addr()).await.unwrap();
    conn.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let resp = read_response_string(&mut conn).await;
    assert!(resp.starts_with("HTTP/1.1 407 "), "got: {resp}");
    assert!(resp.contains("Proxy-Authenticate: Basic"), "got: {resp}");
    assert!(resp.contains("Via: nx-proxy"), "got: {resp}");

    // wrong password
    let mut conn = TcpStream::connect(service.local_addr()).await.unwrap();
    let bad = base64_encode("maddsua:nope");
    conn.write_all(
        format!(
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic {bad}\r\n\r\n"
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    let resp = read_response_string(&mut conn).await;
    assert!(resp.starts_with("HTTP/1.1 403 "), "got: {resp}");
    assert!(resp.contains("Proxy-Connection: Close"), "got: {resp}");

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_http_proxy_rejects_disabled_peer() {
    let service = HttpService::bind(
        slot_opts(ProxyProto::Http, "127.0.0.1:0"),
        DnsHandle::new(),
    )
    .await
    .expect("bind service");

    let mut disabled = peer_opts("b9cfd40e-255c-4101-85b9-73ab9efb509f", "maddsua", "test123");
    disabled.disabled = true;
    service.set_peers(vec![disabled]);

    let mut conn = TcpStream::connect(service.local_addr()).await.unwrap();
    let auth = base64_encode("maddsua:test123");
    conn.write_all(
        format!(
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic {auth}\r\n\r\n"
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    let resp = read_response_string(&mut conn).await;
    assert!(resp.starts_with("HTTP/1.1 402 "), "got: {resp}");

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_hub_reconciliation() {
    let hub = ServiceHub::new();

    let slot_id = Uuid::new_v4();

    // create
    hub.set_services(vec![ServiceOptions {
        slot: SlotOptions {
            id: slot_id,
            proto: ProxyProto::Socks,
            bind_addr: "127.0.0.1:0".to_string(),
        },
        peers: vec![peer_opts(
            "b9cfd40e-255c-4101-85b9-73ab9efb509f",
            "maddsua",
            "test123",
        )],
    }])
    .await;

    let infos = hub.slot_infos().await;
    assert_eq!(infos.len(), 1);
    assert!(infos[0].up);
    assert_eq!(infos[0].id, slot_id);
    assert_eq!(infos[0].registered_peers, 1);

    // compatible update: same proto and bind addr, new id and peer set
    let new_id = Uuid::new_v4();
    hub.set_services(vec![ServiceOptions {
        slot: SlotOptions {
            id: new_id,
            proto: ProxyProto::Socks,
            bind_addr: "127.0.0.1:0".to_string(),
        },
        peers: vec![
            peer_opts("b9cfd40e-255c-4101-85b9-73ab9efb509f", "maddsua", "test123"),
            peer_opts("c0db0438-4d76-4c53-83f1-81fe053e0102", "someoneelse", "88888888888"),
        ],
    }])
    .await;

    let infos = hub.slot_infos().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, new_id);
    assert_eq!(infos[0].registered_peers, 2);

    // incompatible update: the protocol changed for the same bind key
    hub.set_services(vec![ServiceOptions {
        slot: SlotOptions {
            id: Uuid::new_v4(),
            proto: ProxyProto::Http,
            bind_addr: "127.0.0.1:0".to_string(),
        },
        peers: vec![],
    }])
    .await;

    let infos = hub.slot_infos().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].proto, ProxyProto::Http);
    assert_eq!(infos[0].registered_peers, 0);

    // empty config removes everything
    hub.set_services(vec![]).await;
    assert!(hub.slot_infos().await.is_empty());
}

#[tokio::test]
async fn test_hub_skips_invalid_entries() {
    let hub = ServiceHub::new();

    let valid_id = Uuid::new_v4();

    hub.set_services(vec![
        // hostname bind addresses are rejected
        ServiceOptions {
            slot: SlotOptions {
                id: Uuid::new_v4(),
                proto: ProxyProto::Socks,
                bind_addr: "localhost:1080".to_string(),
            },
            peers: vec![],
        },
        // nil slot id
        ServiceOptions {
            slot: SlotOptions {
                id: Uuid::nil(),
                proto: ProxyProto::Socks,
                bind_addr: "127.0.0.1:0".to_string(),
            },
            peers: vec![],
        },
        ServiceOptions {
            slot: SlotOptions {
                id: valid_id,
                proto: ProxyProto::Socks,
                bind_addr: "127.0.0.1:0".to_string(),
            },
            peers: vec![],
        },
    ])
    .await;

    let infos = hub.slot_infos().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, valid_id);

    hub.close_slots().await;
}

#[tokio::test]
async fn test_hub_reports_bind_failures() {
    let hub = ServiceHub::new();

    // grab a port so the slot cannot have it
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = blocker.local_addr().unwrap();

    hub.set_services(vec![ServiceOptions {
        slot: SlotOptions {
            id: Uuid::new_v4(),
            proto: ProxyProto::Socks,
            bind_addr: taken.to_string(),
        },
        peers: vec![],
    }])
    .await;

    let infos = hub.slot_infos().await;
    assert_eq!(infos.len(), 1);
    assert!(!infos[0].up);
    assert!(infos[0].error.is_some());
}

#[tokio::test]
async fn test_socks5_refuses_local_destinations() {
    let service = Socks5Service::bind(
        slot_opts(ProxyProto::Socks, "127.0.0.1:0"),
        DnsHandle::new(),
    )
    .await
    .expect("bind service");

    service.set_peers(vec![peer_opts(
        "b9cfd40e-255c-4101-85b9-73ab9efb509f",
        "maddsua",
        "test123",
    )]);

    let mut conn = TcpStream::connect(service.local_addr()).await.unwrap();

    conn.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut buff = [0u8; 2];
    conn.read_exact(&mut buff).await.unwrap();

    let mut frame = vec![0x01, 7];
    frame.extend_from_slice(b"maddsua");
    frame.push(7);
    frame.extend_from_slice(b"test123");
    conn.write_all(&frame).await.unwrap();
    conn.read_exact(&mut buff).await.unwrap();
    assert_eq!(buff, [0x01, 0x00]);

    // CONNECT to a loopback destination is refused by policy
    let request = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90];
    conn.write_all(&request).await.unwrap();

    let mut reply = [0u8; 2];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_service_close_releases_port() {
    let service = Socks5Service::bind(
        slot_opts(ProxyProto::Socks, "127.0.0.1:0"),
        DnsHandle::new(),
    )
    .await
    .expect("bind service");

    let addr = service.local_addr();
    service.close().await.unwrap();

    // give the runtime a beat, then the port must be bindable again
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::net::TcpListener::bind(addr).await.expect("rebind");
}

fn base64_encode(val: &str) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(val)
}
