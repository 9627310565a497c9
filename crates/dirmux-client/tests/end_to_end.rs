#![cfg(unix)]

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use dirmux_client::{
    BindMetadata, ClientError, Connection, ConnectionConfig, Multiplexer, ReaderState,
    UnsolicitedNotice,
};
use dirmux_frame::message::{encode_extended_response, encode_result, encode_search_entry};
use dirmux_frame::{
    ber, oid, result_code, ExtendedResponse, Frame, FrameError, FrameReader, LdapResult,
    ProtocolOp, Request,
};
use dirmux_transport::{
    CertificateProblems, StreamPair, TlsHandshakeError, TlsUpgrader, TransportStream,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

/// The directory-server end of a socketpair.
struct FakeServer {
    raw: UnixStream,
    reader: FrameReader<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
}

impl FakeServer {
    fn new(raw: UnixStream) -> Self {
        let reader: Box<dyn Read + Send> = Box::new(raw.try_clone().unwrap());
        let writer: Box<dyn Write + Send> = Box::new(raw.try_clone().unwrap());
        Self {
            raw,
            reader: FrameReader::new(reader),
            writer,
        }
    }

    fn recv(&mut self) -> Frame {
        self.reader.read_frame().expect("server read")
    }

    /// Returns true if nothing arrives within `window`.
    fn quiet_for(&mut self, window: Duration) -> bool {
        self.raw.set_read_timeout(Some(window)).unwrap();
        let quiet = matches!(
            self.reader.read_frame(),
            Err(FrameError::Io(err)) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
        );
        self.raw.set_read_timeout(None).unwrap();
        quiet
    }

    fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
        self.writer.flush().unwrap();
    }

    fn send_result(&mut self, id: i32, op: ProtocolOp, result: &LdapResult) {
        let mut buf = BytesMut::new();
        encode_result(id, op, result, &mut buf).unwrap();
        self.send(&buf);
    }

    fn send_entry(&mut self, id: i32, dn: &str) {
        let mut buf = BytesMut::new();
        let values: &[&[u8]] = &[dn.as_bytes()];
        encode_search_entry(id, dn, &[("cn", values)], &mut buf).unwrap();
        self.send(&buf);
    }

    fn send_done(&mut self, id: i32) {
        self.send_result(id, ProtocolOp::SearchResultDone, &LdapResult::success());
    }

    fn send_extended(&mut self, id: i32, response: &ExtendedResponse) {
        let mut buf = BytesMut::new();
        encode_extended_response(id, response, &mut buf).unwrap();
        self.send(&buf);
    }

    /// Continue with the toy cipher the client's [`XorUpgrader`] uses.
    fn switch_to_xor(&mut self) {
        let reader: Box<dyn Read + Send> = Box::new(Xor(self.raw.try_clone().unwrap()));
        self.reader = FrameReader::new(reader);
        self.writer = Box::new(Xor(self.raw.try_clone().unwrap()));
    }
}

fn config() -> ConnectionConfig {
    ConnectionConfig::default().with_reader_poll_interval(Duration::from_millis(20))
}

fn open(config: ConnectionConfig) -> (Connection, FakeServer) {
    let (client, server) = UnixStream::pair().unwrap();
    let connection = Connection::open(client.into(), "directory.test", config).unwrap();
    (connection, FakeServer::new(server))
}

fn search() -> Request {
    Request::new(ProtocolOp::SearchRequest, &b"\x04\x00"[..])
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn search_replies_arrive_in_order() {
    let (connection, mut server) = open(config());
    let server = thread::spawn(move || {
        let request = server.recv();
        assert_eq!(request.op, ProtocolOp::SearchRequest);
        server.send_entry(request.message_id, "cn=a");
        server.send_entry(request.message_id, "cn=b");
        server.send_done(request.message_id);
        server
    });

    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), WAIT, None).unwrap();

    let ops: Vec<ProtocolOp> = (0..3)
        .map(|_| mux.next_response(Some(id)).unwrap().unwrap().op)
        .collect();
    assert_eq!(
        ops,
        vec![
            ProtocolOp::SearchResultEntry,
            ProtocolOp::SearchResultEntry,
            ProtocolOp::SearchResultDone,
        ]
    );
    assert!(mux.is_empty());
    assert!(connection.outstanding().is_empty());
    server.join().unwrap();
}

#[test]
fn interleaved_replies_are_routed_by_id() {
    let (connection, mut server) = open(config());
    let server = thread::spawn(move || {
        let first = server.recv().message_id;
        let second = server.recv().message_id;
        server.send_entry(second, "cn=second");
        server.send_entry(first, "cn=first");
        server.send_done(second);
        server.send_done(first);
        server
    });

    let mux = Multiplexer::new();
    let first = mux.submit(&connection, &search(), WAIT, None).unwrap();
    let second = mux.submit(&connection, &search(), WAIT, None).unwrap();
    assert_ne!(first, second);

    let mut seen = Vec::new();
    while let Some(frame) = mux.next_response(None).unwrap() {
        seen.push((frame.message_id, frame.op));
    }
    assert_eq!(seen.len(), 4);
    for id in [first, second] {
        let ops: Vec<ProtocolOp> = seen
            .iter()
            .filter(|(got, _)| *got == id)
            .map(|(_, op)| *op)
            .collect();
        assert_eq!(
            ops,
            vec![ProtocolOp::SearchResultEntry, ProtocolOp::SearchResultDone]
        );
    }
    server.join().unwrap();
}

#[test]
fn timeout_abandons_and_drops_late_reply() {
    let (connection, mut server) = open(config());
    let (late_sent, late_rx) = mpsc::channel();
    let server = thread::spawn(move || {
        let request = server.recv();
        let abandon = server.recv();
        assert_eq!(abandon.op, ProtocolOp::AbandonRequest);
        assert_eq!(
            ber::decode_integer(&abandon.op_content()).unwrap(),
            i64::from(request.message_id)
        );
        server.send_done(request.message_id);
        late_sent.send(()).unwrap();
        server
    });

    let mux = Multiplexer::new();
    let timeout = Duration::from_millis(100);
    let id = mux
        .submit(&connection, &search(), Some(timeout), None)
        .unwrap();

    let err = mux.next_response(Some(id)).unwrap_err();
    assert!(matches!(
        err,
        ClientError::ClientTimeout { message_id, timeout: t } if message_id == id && t == timeout
    ));
    assert!(matches!(
        mux.next_response(Some(id)),
        Err(ClientError::NoSuchRequest(_))
    ));

    late_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(mux.is_empty());
    assert!(!mux.is_response_received(None));
    assert!(connection.outstanding().is_empty());
    server.join().unwrap();
}

#[test]
fn abandoning_a_completed_request_frees_its_id() {
    let (connection, mut server) = open(config());
    let mux = Multiplexer::new();
    let pinned = search().with_message_id(7);
    let id = mux.submit(&connection, &pinned, WAIT, None).unwrap();

    assert_eq!(server.recv().message_id, id);
    server.send_done(id);
    assert!(eventually(|| mux.is_complete(id).unwrap_or(false)));

    mux.abandon(id).unwrap();
    assert!(mux.is_empty());
    assert!(connection.outstanding().is_empty());
    assert!(
        server.quiet_for(Duration::from_millis(100)),
        "completed request must not be abandoned on the wire"
    );

    let again = mux.submit(&connection, &pinned, WAIT, None).unwrap();
    assert_eq!(again, id);
    assert_eq!(server.recv().message_id, id);
    server.send_done(id);
    assert_eq!(
        mux.next_response(Some(id)).unwrap().unwrap().op,
        ProtocolOp::SearchResultDone
    );
}

#[test]
fn reader_death_fails_outstanding_requests() {
    let (connection, mut server) = open(config());
    let server = thread::spawn(move || {
        server.recv();
        drop(server);
    });

    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), None, None).unwrap();
    let err = mux.next_response(Some(id)).unwrap_err();
    assert!(matches!(err, ClientError::ReaderDied(_)), "got {err:?}");
    server.join().unwrap();

    assert!(matches!(connection.reader_state(), ReaderState::Failed(_)));
    assert!(!connection.is_connected());
    assert!(matches!(
        mux.submit(&connection, &search(), None, None),
        Err(ClientError::ConnectionClosed(_))
    ));
}

#[test]
fn notice_of_disconnection_reaches_listeners_and_requests() {
    let (connection, mut server) = open(config());
    let (tx, notices) = mpsc::channel();
    let tx = Mutex::new(tx);
    connection.add_listener(Arc::new(move |notice: &UnsolicitedNotice| {
        let _ = tx.lock().unwrap().send(notice.clone());
    }));

    let server = thread::spawn(move || {
        server.recv();
        server.send_extended(
            0,
            &ExtendedResponse {
                result: LdapResult::new(result_code::UNAVAILABLE, "maintenance"),
                oid: Some(oid::NOTICE_OF_DISCONNECTION.to_string()),
                value: None,
            },
        );
        drop(server);
    });

    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), None, None).unwrap();
    let err = mux.next_response(Some(id)).unwrap_err();
    assert!(matches!(err, ClientError::ServerShutdownNotice(_)), "got {err:?}");
    assert!(connection.server_shutdown_noticed());

    let notice = notices.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(notice.is_notice_of_disconnection());
    assert_eq!(notice.diagnostic_message, "maintenance");
    server.join().unwrap();
}

#[test]
fn write_after_notice_of_disconnection_reports_notice() {
    let (connection, mut server) = open(config());
    server.send_extended(
        0,
        &ExtendedResponse {
            result: LdapResult::new(result_code::UNAVAILABLE, "maintenance"),
            oid: Some(oid::NOTICE_OF_DISCONNECTION.to_string()),
            value: None,
        },
    );
    drop(server);

    assert!(eventually(|| !connection.is_connected()));
    assert!(connection.server_shutdown_noticed());
    let err = connection.write_request(&search()).unwrap_err();
    assert!(matches!(err, ClientError::ServerShutdownNotice(_)), "got {err:?}");
}

#[test]
fn unknown_ids_and_other_notices_do_not_disturb_requests() {
    let (connection, mut server) = open(config());
    let server = thread::spawn(move || {
        let request = server.recv();
        server.send_done(request.message_id + 1000);
        server.send_extended(
            0,
            &ExtendedResponse {
                result: LdapResult::success(),
                oid: Some("1.3.6.1.4.1.4203.1.11.99".to_string()),
                value: Some(bytes::Bytes::from_static(b"hello")),
            },
        );
        server.send_done(request.message_id);
        server
    });

    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), WAIT, None).unwrap();
    let reply = mux.next_response(Some(id)).unwrap().unwrap();
    assert_eq!(reply.op, ProtocolOp::SearchResultDone);
    assert!(!connection.server_shutdown_noticed());
    assert!(connection.is_connected());
    server.join().unwrap();
}

#[test]
fn bind_holds_write_access_until_it_completes() {
    let (connection, mut server) = open(config());
    let connection = Arc::new(connection);

    let mux = Multiplexer::new();
    let bind = mux
        .submit(
            &connection,
            &Request::simple_bind(3, "cn=admin,dc=test", b"secret"),
            WAIT,
            Some(BindMetadata::simple(3, "cn=admin,dc=test")),
        )
        .unwrap();
    assert_eq!(server.recv().op, ProtocolOp::BindRequest);

    let searcher = {
        let connection = Arc::clone(&connection);
        let mux = mux.clone();
        thread::spawn(move || mux.submit(&connection, &search(), WAIT, None).unwrap())
    };

    assert!(
        server.quiet_for(Duration::from_millis(150)),
        "search was written while the bind was outstanding"
    );
    server.send_result(bind, ProtocolOp::BindResponse, &LdapResult::success());

    let search_request = server.recv();
    assert_eq!(search_request.op, ProtocolOp::SearchRequest);
    let search_id = searcher.join().unwrap();
    assert_eq!(search_request.message_id, search_id);
    server.send_done(search_id);

    assert_eq!(
        mux.next_response(Some(bind)).unwrap().unwrap().op,
        ProtocolOp::BindResponse
    );
    assert!(connection.is_bound());
    assert_eq!(
        connection.bound_identity().unwrap().dn,
        "cn=admin,dc=test"
    );
    assert!(mux.next_response(Some(search_id)).unwrap().is_some());
}

#[test]
fn bind_timeout_releases_write_access() {
    let (connection, mut server) = open(config());
    let mux = Multiplexer::new();
    let timeout = Duration::from_millis(150);
    let bind = mux
        .submit(
            &connection,
            &Request::simple_bind(3, "cn=admin,dc=test", b"secret"),
            Some(timeout),
            Some(BindMetadata::simple(3, "cn=admin,dc=test")),
        )
        .unwrap();
    assert_eq!(server.recv().op, ProtocolOp::BindRequest);

    let err = mux.next_response(Some(bind)).unwrap_err();
    assert!(matches!(
        err,
        ClientError::ClientTimeout { message_id, timeout: t } if message_id == bind && t == timeout
    ));
    assert!(!connection.is_bound());

    let search_id = mux.submit(&connection, &search(), WAIT, None).unwrap();
    let next = server.recv();
    assert_eq!(next.op, ProtocolOp::SearchRequest);
    assert_eq!(next.message_id, search_id);
    server.send_done(search_id);
    assert!(mux.next_response(Some(search_id)).unwrap().is_some());
}

#[test]
fn failed_bind_leaves_connection_unbound() {
    let (connection, mut server) = open(config());
    let mux = Multiplexer::new();
    let bind = mux
        .submit(
            &connection,
            &Request::simple_bind(3, "cn=admin", b"wrong"),
            WAIT,
            Some(BindMetadata::simple(3, "cn=admin")),
        )
        .unwrap();
    server.recv();
    server.send_result(
        bind,
        ProtocolOp::BindResponse,
        &LdapResult::new(result_code::INVALID_CREDENTIALS, "nope"),
    );
    mux.next_response(Some(bind)).unwrap().unwrap();
    assert!(!connection.is_bound());

    // Write access was released with the failed bind.
    let id = connection.write_request(&Request::unbind()).unwrap();
    assert_eq!(server.recv().message_id, id);
}

#[test]
fn sasl_in_progress_keeps_write_access() {
    let (connection, mut server) = open(config());
    let mux = Multiplexer::new();
    let bind = mux
        .submit(
            &connection,
            &Request::simple_bind(3, "", b""),
            WAIT,
            Some(BindMetadata::anonymous(3)),
        )
        .unwrap();
    server.recv();
    server.send_result(
        bind,
        ProtocolOp::BindResponse,
        &LdapResult::new(result_code::SASL_BIND_IN_PROGRESS, ""),
    );
    mux.next_response(Some(bind)).unwrap().unwrap();
    assert!(!connection.is_bound());

    let (done_tx, done_rx) = mpsc::channel();
    let connection = Arc::new(connection);
    let writer = {
        let connection = Arc::clone(&connection);
        thread::spawn(move || {
            let id = connection.write_request(&Request::unbind()).unwrap();
            done_tx.send(id).unwrap();
        })
    };
    assert!(done_rx.recv_timeout(Duration::from_millis(150)).is_err());

    assert!(connection.release_bind_hold());
    let id = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(server.recv().message_id, id);
    writer.join().unwrap();
}

#[test]
fn shutdown_unblocks_waiters() {
    let (connection, mut server) = open(config());
    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), None, None).unwrap();
    server.recv();

    let waiter = {
        let mux = mux.clone();
        thread::spawn(move || mux.next_response(Some(id)))
    };
    thread::sleep(Duration::from_millis(50));
    connection.shutdown("client exiting");

    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, ClientError::ConnectionClosed(reason) if reason == "client exiting"));
    assert_eq!(connection.reader_state(), ReaderState::Closed);
    assert!(!connection.is_connected());
}

#[test]
fn shutdown_sends_unbind_when_bound() {
    let (connection, mut server) = open(config());
    let mux = Multiplexer::new();
    let bind = mux
        .submit(
            &connection,
            &Request::simple_bind(3, "cn=u", b"pw"),
            WAIT,
            Some(BindMetadata::simple(3, "cn=u")),
        )
        .unwrap();
    server.recv();
    server.send_result(bind, ProtocolOp::BindResponse, &LdapResult::success());
    mux.next_response(Some(bind)).unwrap().unwrap();
    assert!(eventually(|| connection.is_bound()));

    connection.disconnect();
    assert_eq!(server.recv().op, ProtocolOp::UnbindRequest);
}

#[test]
fn last_handle_release_closes_the_connection() {
    let (connection, mut server) = open(config());
    let other = connection.share();
    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), None, None).unwrap();
    server.recv();

    connection.release(false);
    assert!(other.is_connected());

    drop(other);
    let err = mux.next_response(Some(id)).unwrap_err();
    assert!(matches!(err, ClientError::ConnectionClosed(_)));
}

#[test]
fn merged_multiplexer_receives_both_replies() {
    let (connection, mut server) = open(config());
    let a = Multiplexer::new();
    let b = Multiplexer::new();
    let first = a.submit(&connection, &search(), WAIT, None).unwrap();
    let second = b.submit(&connection, &search(), WAIT, None).unwrap();
    server.recv();
    server.recv();

    a.merge(&b);
    assert!(b.is_empty());
    server.send_done(second);
    server.send_done(first);

    let mut ids = vec![
        a.next_response(None).unwrap().unwrap().message_id,
        a.next_response(None).unwrap().unwrap().message_id,
    ];
    ids.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(a.next_response(None).unwrap().is_none());
}

#[test]
fn pinned_message_ids_must_be_unique() {
    let (connection, mut server) = open(config());
    let mux = Multiplexer::new();
    let id = mux
        .submit(&connection, &search().with_message_id(50), None, None)
        .unwrap();
    assert_eq!(id, 50);
    assert_eq!(server.recv().message_id, 50);

    let err = mux
        .submit(&connection, &search().with_message_id(50), None, None)
        .unwrap_err();
    assert!(matches!(err, ClientError::DuplicateMessageId(50)));

    mux.abandon(50).unwrap();
    let abandon = server.recv();
    assert_eq!(abandon.op, ProtocolOp::AbandonRequest);
    assert!(connection.outstanding().is_empty());
}

#[test]
fn stopped_reader_resumes_with_buffered_bytes() {
    let (connection, mut server) = open(config());
    connection.stop_reader_now();
    assert!(eventually(|| connection.reader_state() == ReaderState::Stopped));

    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), WAIT, None).unwrap();
    server.recv();
    server.send_done(id);
    assert!(!mux.is_response_received(Some(id)));

    // connect() on a connection with a parked reader restarts it.
    connection.connect("directory.test", 389).unwrap();
    assert_eq!(connection.reader_state(), ReaderState::Running);
    assert!(mux.next_response(Some(id)).unwrap().is_some());
}

#[test]
fn resume_reading_cancels_a_pending_stop() {
    let (connection, mut server) = open(config());
    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), WAIT, None).unwrap();
    connection.stop_reader_after(id);
    server.recv();
    server.send_done(id);
    assert!(mux.next_response(Some(id)).unwrap().is_some());
    assert!(eventually(|| connection.reader_state() == ReaderState::Stopped));

    connection.resume_reading().unwrap();
    assert_eq!(connection.reader_state(), ReaderState::Running);

    let next = mux.submit(&connection, &search(), WAIT, None).unwrap();
    server.recv();
    server.send_done(next);
    assert!(mux.next_response(Some(next)).unwrap().is_some());
}

/// Toy cipher standing in for TLS: every byte is XORed with a constant.
struct Xor<T>(T);

const XOR_KEY: u8 = 0x5A;

impl<T: Read> Read for Xor<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.0.read(buf)?;
        buf[..n].iter_mut().for_each(|b| *b ^= XOR_KEY);
        Ok(n)
    }
}

impl<T: Write> Write for Xor<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let scrambled: Vec<u8> = buf.iter().map(|b| b ^ XOR_KEY).collect();
        self.0.write(&scrambled)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

struct XorUpgrader;

impl TlsUpgrader for XorUpgrader {
    fn upgrade(
        &self,
        host: &str,
        stream: TransportStream,
        _problems: &CertificateProblems,
    ) -> dirmux_transport::Result<StreamPair> {
        assert_eq!(host, "directory.test");
        Ok(StreamPair {
            reader: Box::new(Xor(stream.try_clone()?)),
            writer: Box::new(Xor(stream)),
        })
    }

    fn name(&self) -> &'static str {
        "xor"
    }
}

struct RejectingUpgrader;

impl TlsUpgrader for RejectingUpgrader {
    fn upgrade(
        &self,
        _host: &str,
        _stream: TransportStream,
        problems: &CertificateProblems,
    ) -> dirmux_transport::Result<StreamPair> {
        problems.record("certificate is self-signed");
        Err(TlsHandshakeError::new("untrusted certificate").into())
    }
}

#[test]
fn start_tls_swaps_streams_mid_session() {
    let (connection, mut server) = open(config().with_tls(Arc::new(XorUpgrader)));
    let server = thread::spawn(move || {
        let start = server.recv();
        assert_eq!(start.op, ProtocolOp::ExtendedRequest);
        server.send_extended(
            start.message_id,
            &ExtendedResponse {
                result: LdapResult::success(),
                oid: Some(oid::START_TLS.to_string()),
                value: None,
            },
        );
        server.switch_to_xor();

        let request = server.recv();
        assert_eq!(request.op, ProtocolOp::SearchRequest);
        server.send_done(request.message_id);
        server
    });

    connection.negotiate_start_tls(WAIT).unwrap();
    assert!(connection.is_tls());
    assert_eq!(connection.reader_state(), ReaderState::Running);

    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), WAIT, None).unwrap();
    let reply = mux.next_response(Some(id)).unwrap().unwrap();
    assert_eq!(reply.op, ProtocolOp::SearchResultDone);
    server.join().unwrap();
}

#[test]
fn start_tls_refused_keeps_plaintext() {
    let (connection, mut server) = open(config().with_tls(Arc::new(XorUpgrader)));
    let server = thread::spawn(move || {
        let start = server.recv();
        server.send_extended(
            start.message_id,
            &ExtendedResponse {
                result: LdapResult::new(result_code::OPERATIONS_ERROR, "no TLS here"),
                oid: None,
                value: None,
            },
        );
        let request = server.recv();
        server.send_done(request.message_id);
        server
    });

    let err = connection.negotiate_start_tls(WAIT).unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)), "got {err:?}");
    assert!(!connection.is_tls());

    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), WAIT, None).unwrap();
    assert!(mux.next_response(Some(id)).unwrap().is_some());
    server.join().unwrap();
}

#[test]
fn start_tls_requires_a_quiet_connection() {
    let (connection, mut server) = open(config().with_tls(Arc::new(XorUpgrader)));
    let mux = Multiplexer::new();
    mux.submit(&connection, &search(), None, None).unwrap();
    server.recv();

    let err = connection.negotiate_start_tls(WAIT).unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)));
}

#[test]
fn failed_handshake_restores_plaintext() {
    let (connection, mut server) = open(config().with_tls(Arc::new(RejectingUpgrader)));

    let err = connection.start_tls().unwrap_err();
    match err {
        ClientError::TlsHandshakeFailed { reason, problems } => {
            assert_eq!(reason, "untrusted certificate");
            assert_eq!(problems, vec!["certificate is self-signed".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!connection.is_tls());
    assert_eq!(connection.reader_state(), ReaderState::Running);

    let mux = Multiplexer::new();
    let id = mux.submit(&connection, &search(), WAIT, None).unwrap();
    assert_eq!(server.recv().message_id, id);
    server.send_done(id);
    assert!(mux.next_response(Some(id)).unwrap().is_some());
}

#[test]
fn stop_tls_returns_to_plaintext() {
    let (connection, mut server) = open(config().with_tls(Arc::new(XorUpgrader)));
    connection.start_tls().unwrap();
    server.switch_to_xor();

    let id = connection.write_request(&Request::unbind()).unwrap();
    assert_eq!(server.recv().message_id, id);

    connection.stop_tls().unwrap();
    assert!(!connection.is_tls());
    let server_raw = server.raw.try_clone().unwrap();
    let mut plain = FakeServer::new(server_raw);
    let id = connection.write_request(&Request::unbind()).unwrap();
    assert_eq!(plain.recv().message_id, id);
}
