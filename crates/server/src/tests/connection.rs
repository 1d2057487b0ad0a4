use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};

use drover_codec::error::Code;
use drover_codec::qpack::HeaderField;
use drover_codec::stream::{Fin, StreamId};

use crate::children::{ChildExit, Shutdown};
use crate::connection::Event;
use crate::error::Reason;
use crate::handler::{
    Body, ChildSpec, Command, Commands, InfoMsg, Request, StreamHandler,
};
use crate::transport::ShutdownFlag;

use super::*;

/// Answers every request with a fixed response.
struct Respond {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl Respond {
    fn with(status: StatusCode, body: impl Into<Body>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

impl StreamHandler for Respond {
    type State = ();

    fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
        (
            vec![Command::Response(self.status, self.headers.clone(), self.body.clone())],
            (),
        )
    }

    fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
        Vec::new()
    }
}

/// Records body chunks and answers 200 once the body is complete.
struct Collect {
    seen: Arc<Mutex<Vec<(Fin, Bytes)>>>,
}

impl StreamHandler for Collect {
    type State = ();

    fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
        (Vec::new(), ())
    }

    fn data(&self, _id: StreamId, fin: Fin, data: Bytes, _state: &mut ()) -> Commands {
        self.seen.lock().unwrap().push((fin, data));
        if fin.is_fin() {
            vec![Command::Response(StatusCode::OK, HeaderMap::new(), Body::empty())]
        } else {
            Vec::new()
        }
    }
}

/// Gives up immediately.
struct StopNow {
    terminated: Arc<AtomicBool>,
}

impl StreamHandler for StopNow {
    type State = ();

    fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
        (vec![Command::Stop], ())
    }

    fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
        Vec::new()
    }

    fn terminate(&self, _id: StreamId, _reason: &Reason, _state: ()) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

fn empty_headers() -> HeaderMap {
    HeaderMap::new()
}

#[tokio::test]
async fn init_opens_the_local_unidi_trio() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    let (result, ops) = peer.close().await;
    result.unwrap();

    assert_eq!(ops[0], Op::StartStream { id: sid(3), bidi: false });
    assert_eq!(ops[1], Op::StartStream { id: sid(7), bidi: false });
    assert_eq!(ops[2], Op::StartStream { id: sid(11), bidi: false });
    // Control stream: type tag, then SETTINGS as the first frame.
    assert_matches!(&ops[3], Op::Send { id, data, fin: false } => {
        assert_eq!(*id, sid(3));
        assert_eq!(&data[..2], &[0x00, 0x04]);
    });
    assert_matches!(&ops[4], Op::Send { id, data, fin: false } => {
        assert_eq!(*id, sid(7));
        assert_eq!(&data[..], &[0x02]);
    });
    assert_matches!(&ops[5], Op::Send { id, data, fin: false } => {
        assert_eq!(*id, sid(11));
        assert_eq!(&data[..], &[0x03]);
    });
    // Clean shutdown carries H3_NO_ERROR.
    assert_eq!(*ops.last().unwrap(), Op::ShutdownConnection { code: 0x100 });
}

#[tokio::test]
async fn hello_get() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_control(2);
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let (result, ops) = peer.close().await;
    result.unwrap();

    // Headers and body go out in one write, finished.
    let sends: Vec<_> = ops
        .iter()
        .filter(|op| matches!(op, Op::Send { id, .. } if *id == sid(0)))
        .collect();
    assert_eq!(sends.len(), 1);

    let (wire, fin) = stream_writes(&ops, 0);
    assert!(fin);
    let frames = parse_wire(wire);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].status(), Some("200"));
    assert_matches!(&frames[1], WireFrame::Data(body) => assert_eq!(&body[..], b"hi"));
}

#[tokio::test]
async fn post_body_split_across_events() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let peer = connect(Collect { seen: seen.clone() });
    peer.open_bidi(0);

    let mut fields = get_request("/upload");
    fields[0] = (":method", "POST").into();
    fields.push(("content-length", "3").into());
    peer.data(0, Fin::NoFin, headers_frame(fields));

    // First DATA frame split across two events: framing header, then its
    // two body bytes. A second DATA frame finishes the stream.
    peer.data(0, Fin::NoFin, &[0x00, 0x02][..]);
    peer.data(0, Fin::NoFin, &b"ab"[..]);
    peer.data(0, Fin::Fin, data_frame(b"c"));

    let (result, ops) = peer.close().await;
    result.unwrap();

    let chunks = seen.lock().unwrap().clone();
    assert_eq!(chunks.len(), 2);
    assert_matches!(&chunks[0], (Fin::NoFin, data) => assert_eq!(&data[..], b"ab"));
    assert_matches!(&chunks[1], (Fin::Fin, data) => assert_eq!(&data[..], b"c"));

    let (wire, fin) = stream_writes(&ops, 0);
    assert!(fin);
    assert_eq!(parse_wire(wire)[0].status(), Some("200"));
}

#[tokio::test]
async fn bad_authority_resets_the_stream_and_lingers() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_bidi(0);
    let mut fields = get_request("/");
    fields[2] = (":authority", "[::invalid").into();
    peer.data(0, Fin::Fin, headers_frame(fields));

    // Late data on the reset stream is suppressed by lingering.
    peer.data(0, Fin::Fin, data_frame(b"late"));

    // The connection survives and serves the next request.
    peer.open_bidi(4);
    peer.data(4, Fin::Fin, headers_frame(get_request("/")));

    let (result, ops) = peer.close().await;
    result.unwrap();

    assert!(ops.contains(&Op::ShutdownStream {
        id: sid(0),
        flag: ShutdownFlag::Abort,
        code: Code::H3_MESSAGE_ERROR.value(),
    }));
    let (wire, fin) = stream_writes(&ops, 4);
    assert!(fin);
    assert_eq!(parse_wire(wire)[0].status(), Some("200"));
}

#[tokio::test]
async fn missing_authority_and_host_is_a_message_error() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_bidi(0);
    let fields: Vec<HeaderField> = vec![
        (":method", "GET").into(),
        (":scheme", "https").into(),
        (":path", "/").into(),
    ];
    peer.data(0, Fin::Fin, headers_frame(fields));
    let (result, ops) = peer.close().await;
    result.unwrap();

    assert!(ops.contains(&Op::ShutdownStream {
        id: sid(0),
        flag: ShutdownFlag::Abort,
        code: Code::H3_MESSAGE_ERROR.value(),
    }));
}

#[tokio::test]
async fn host_header_stands_in_for_authority() {
    let captured = Arc::new(Mutex::new(None));
    let peer = connect(Capture { slot: captured.clone() });
    peer.open_bidi(0);
    let mut fields: Vec<HeaderField> = vec![
        (":method", "GET").into(),
        (":scheme", "http").into(),
        (":path", "/").into(),
    ];
    fields.push(("host", "example.com").into());
    peer.data(0, Fin::Fin, headers_frame(fields));
    let (result, _) = peer.close().await;
    result.unwrap();

    let request = captured.lock().unwrap().take().unwrap();
    assert_eq!(request.host, "example.com");
    assert_eq!(request.port, Some(80));
}

#[tokio::test]
async fn empty_path_is_a_message_error() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_bidi(0);
    let mut fields = get_request("/");
    fields[3] = (":path", "?query-only").into();
    peer.data(0, Fin::Fin, headers_frame(fields));
    let (result, ops) = peer.close().await;
    result.unwrap();

    assert!(ops.iter().any(|op| matches!(
        op,
        Op::ShutdownStream { id, code, .. } if *id == sid(0) && *code == Code::H3_MESSAGE_ERROR.value()
    )));
}

#[tokio::test]
async fn sendfile_response() {
    let body = Body::Sendfile {
        path: "/tmp/x".into(),
        offset: 0,
        len: 1_048_576,
    };
    let mut handler = Respond::with(StatusCode::OK, Body::empty());
    handler.body = body;
    handler
        .headers
        .insert("content-length", HeaderValue::from_static("1048576"));

    let peer = connect(handler);
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/big")));
    let (result, ops) = peer.close().await;
    result.unwrap();

    let stream_ops: Vec<_> = ops
        .iter()
        .filter(|op| {
            matches!(op, Op::Send { id, .. } | Op::Sendfile { id, .. } if *id == sid(0))
        })
        .collect();
    assert_eq!(stream_ops.len(), 4);

    // Response headers, open.
    assert_matches!(stream_ops[0], Op::Send { fin: false, data, .. } => {
        assert_eq!(parse_wire(data.clone())[0].status(), Some("200"));
    });
    // DATA framing header for the whole file.
    assert_matches!(stream_ops[1], Op::Send { fin: false, data, .. } => {
        assert_eq!(&data[..], &[0x00, 0x80, 0x10, 0x00, 0x00]);
    });
    assert_eq!(
        *stream_ops[2],
        Op::Sendfile {
            id: sid(0),
            path: "/tmp/x".into(),
            offset: 0,
            len: 1_048_576,
        }
    );
    // Empty DATA frame carries the fin.
    assert_matches!(stream_ops[3], Op::Send { fin: true, data, .. } => {
        assert_eq!(&data[..], &[0x00, 0x00]);
    });
}

#[tokio::test]
async fn stop_on_an_idle_stream_synthesizes_204() {
    let terminated = Arc::new(AtomicBool::new(false));
    let peer = connect(StopNow { terminated: terminated.clone() });
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let (result, ops) = peer.close().await;
    result.unwrap();

    let (wire, fin) = stream_writes(&ops, 0);
    assert!(fin);
    assert_eq!(parse_wire(wire)[0].status(), Some("204"));
    // The request was already finished, so the receive half stays alone.
    assert!(!ops.iter().any(|op| matches!(op, Op::ShutdownStream { id, .. } if *id == sid(0))));
    assert!(terminated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stop_mid_body_aborts_reading() {
    let terminated = Arc::new(AtomicBool::new(false));
    let peer = connect(StopNow { terminated: terminated.clone() });
    peer.open_bidi(0);
    let mut fields = get_request("/");
    fields.push(("content-length", "10").into());
    peer.data(0, Fin::NoFin, headers_frame(fields));
    let (result, ops) = peer.close().await;
    result.unwrap();

    assert!(ops.contains(&Op::ShutdownStream {
        id: sid(0),
        flag: ShutdownFlag::AbortReceive,
        code: Code::H3_NO_ERROR.value(),
    }));
    let (wire, fin) = stream_writes(&ops, 0);
    assert!(fin);
    assert_eq!(parse_wire(wire)[0].status(), Some("204"));
}

#[tokio::test]
async fn unknown_unidi_type_aborts_only_that_stream() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_uni(6);
    peer.data(6, Fin::NoFin, &[0x7f][..]);

    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let (result, ops) = peer.close().await;
    result.unwrap();

    assert!(ops.contains(&Op::ShutdownStream {
        id: sid(6),
        flag: ShutdownFlag::AbortReceive,
        code: Code::H3_STREAM_CREATION_ERROR.value(),
    }));
    let (wire, _) = stream_writes(&ops, 0);
    assert_eq!(parse_wire(wire)[0].status(), Some("200"));
}

#[tokio::test]
async fn peer_push_stream_kills_the_connection() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_uni(6);
    peer.data(6, Fin::NoFin, &[0x01][..]);
    let (result, ops) = peer.finished().await;

    let error = result.unwrap_err();
    assert_matches!(error.reason(), Reason::ConnectionError(code, _) => {
        assert_eq!(*code, Code::H3_STREAM_CREATION_ERROR);
    });
    assert_eq!(
        *ops.last().unwrap(),
        Op::ShutdownConnection { code: Code::H3_STREAM_CREATION_ERROR.value() }
    );
}

#[tokio::test]
async fn data_truncated_by_fin_is_a_frame_error() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_bidi(0);
    let mut fields = get_request("/");
    fields[0] = (":method", "POST").into();
    peer.data(0, Fin::NoFin, headers_frame(fields));
    // DATA announces five bytes but the stream finishes after one.
    peer.data(0, Fin::Fin, &[0x00, 0x05, b'a'][..]);
    let (result, ops) = peer.finished().await;

    assert_matches!(result.unwrap_err().reason(), Reason::ConnectionError(code, _) => {
        assert_eq!(*code, Code::H3_FRAME_ERROR);
    });
    assert_eq!(
        *ops.last().unwrap(),
        Op::ShutdownConnection { code: Code::H3_FRAME_ERROR.value() }
    );
}

#[tokio::test]
async fn frame_header_truncated_by_fin_is_a_frame_error() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, &[0x01, 0x05, b'x'][..]);
    let (result, _) = peer.finished().await;
    assert_matches!(result.unwrap_err().reason(), Reason::ConnectionError(code, _) => {
        assert_eq!(*code, Code::H3_FRAME_ERROR);
    });
}

#[tokio::test]
async fn goaway_shuts_down_cleanly() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_control(2);
    peer.data(2, Fin::NoFin, &[0x07, 0x01, 0x00][..]);
    let (result, ops) = peer.finished().await;
    result.unwrap();
    assert_eq!(*ops.last().unwrap(), Op::ShutdownConnection { code: 0x100 });
}

#[tokio::test]
async fn handler_panic_resets_with_internal_error() {
    struct Panicking;
    impl StreamHandler for Panicking {
        type State = ();
        fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
            panic!("boom");
        }
        fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
            Vec::new()
        }
    }

    let peer = connect(Panicking);
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let (result, ops) = peer.close().await;
    result.unwrap();

    assert!(ops.contains(&Op::ShutdownStream {
        id: sid(0),
        flag: ShutdownFlag::Abort,
        code: Code::H3_INTERNAL_ERROR.value(),
    }));
}

/// Captures the assembled request, then stops the stream.
struct Capture {
    slot: Arc<Mutex<Option<Request>>>,
}

impl StreamHandler for Capture {
    type State = ();

    fn init(&self, _id: StreamId, req: Request) -> (Commands, ()) {
        *self.slot.lock().unwrap() = Some(req);
        (vec![Command::Stop], ())
    }

    fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
        Vec::new()
    }
}

#[tokio::test]
async fn request_assembly_and_header_folding() {
    let captured = Arc::new(Mutex::new(None));
    let peer = connect(Capture { slot: captured.clone() });
    peer.open_bidi(0);

    let mut fields = get_request("/search?q=drover&page=2");
    fields[2] = (":authority", "example.com:8443").into();
    fields.push(("accept", "text/html").into());
    fields.push(("accept", "text/plain").into());
    fields.push(("cookie", "a=1").into());
    fields.push(("cookie", "b=2").into());
    peer.data(0, Fin::Fin, headers_frame(fields));
    let (result, _) = peer.close().await;
    result.unwrap();

    let request = captured.lock().unwrap().take().unwrap();
    assert_eq!(request.transport, crate::handler::TransportKind::Quic);
    assert_eq!(request.method, http::Method::GET);
    assert_eq!(request.host, "example.com");
    assert_eq!(request.port, Some(8443));
    assert_eq!(request.path, "/search");
    assert_eq!(request.qs, "q=drover&page=2");
    assert_eq!(request.version, http::Version::HTTP_3);
    assert!(!request.has_body);
    assert_eq!(request.headers.get("accept").unwrap(), "text/html, text/plain");
    assert_eq!(request.headers.get("cookie").unwrap(), "a=1; b=2");
}

#[tokio::test]
async fn default_port_follows_the_scheme() {
    let captured = Arc::new(Mutex::new(None));
    let peer = connect(Capture { slot: captured.clone() });
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let (result, _) = peer.close().await;
    result.unwrap();

    let request = captured.lock().unwrap().take().unwrap();
    assert_eq!(request.port, Some(443));
}

/// Streams a response manually: interim, headers, data, trailers.
struct Staged {
    trailers: HeaderMap,
}

impl StreamHandler for Staged {
    type State = ();

    fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
        (
            vec![
                Command::Inform(StatusCode::CONTINUE, HeaderMap::new()),
                Command::Headers(StatusCode::OK, HeaderMap::new()),
                Command::Data(Fin::NoFin, Body::Full(Bytes::from_static(b"partial"))),
                Command::Trailers(self.trailers.clone()),
            ],
            (),
        )
    }

    fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
        Vec::new()
    }
}

#[tokio::test]
async fn staged_response_with_trailers() {
    let mut trailers = HeaderMap::new();
    trailers.insert("x-checksum", HeaderValue::from_static("abc"));
    let peer = connect(Staged { trailers });
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let (result, ops) = peer.close().await;
    result.unwrap();

    let (wire, fin) = stream_writes(&ops, 0);
    assert!(fin);
    let frames = parse_wire(wire);
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0].status(), Some("100"));
    assert_eq!(frames[1].status(), Some("200"));
    assert_matches!(&frames[2], WireFrame::Data(body) => assert_eq!(&body[..], b"partial"));
    assert_matches!(&frames[3], WireFrame::Headers(fields) => {
        assert_eq!(fields, &vec![HeaderField::from(("x-checksum", "abc"))]);
    });
}

#[tokio::test]
async fn empty_trailers_finish_with_an_empty_data_frame() {
    let peer = connect(Staged { trailers: HeaderMap::new() });
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let (result, ops) = peer.close().await;
    result.unwrap();

    let last_send = ops
        .iter()
        .rev()
        .find_map(|op| match op {
            Op::Send { id, data, fin } if *id == sid(0) => Some((data.clone(), *fin)),
            _ => None,
        })
        .unwrap();
    assert_eq!(&last_send.0[..], &[0x00, 0x00]);
    assert!(last_send.1);
}

/// Replies from an info message rather than from init.
struct DeferredReply;

impl StreamHandler for DeferredReply {
    type State = ();

    fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
        (Vec::new(), ())
    }

    fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
        Vec::new()
    }

    fn info(&self, _id: StreamId, msg: InfoMsg, _state: &mut ()) -> Commands {
        match msg {
            InfoMsg::Message(any) => {
                let text = any.downcast_ref::<&str>().copied().unwrap_or("?");
                vec![Command::Response(
                    StatusCode::OK,
                    HeaderMap::new(),
                    Body::Full(Bytes::copy_from_slice(text.as_bytes())),
                )]
            }
            InfoMsg::ChildExit { .. } => Vec::new(),
        }
    }
}

#[tokio::test]
async fn info_messages_reach_the_handler() {
    let peer = connect(DeferredReply);
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let _ = peer.tx.send(Event::StreamMessage {
        id: sid(0),
        msg: Box::new("pong"),
    });
    // A message for a stream that never existed is dropped with a warning.
    let _ = peer.tx.send(Event::StreamMessage {
        id: sid(40),
        msg: Box::new("nobody home"),
    });
    let (result, ops) = peer.close().await;
    result.unwrap();

    let (wire, fin) = stream_writes(&ops, 0);
    assert!(fin);
    let frames = parse_wire(wire);
    assert_eq!(frames[0].status(), Some("200"));
    assert_matches!(&frames[1], WireFrame::Data(body) => assert_eq!(&body[..], b"pong"));
}

/// Spawns a child at init and records its exit notification.
struct Nursery {
    exits: Arc<Mutex<Vec<ChildExit>>>,
}

impl StreamHandler for Nursery {
    type State = ();

    fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
        let handle = tokio::spawn(async {});
        (
            vec![Command::Spawn(ChildSpec {
                handle,
                shutdown: Shutdown::BrutalKill,
            })],
            (),
        )
    }

    fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
        Vec::new()
    }

    fn info(&self, _id: StreamId, msg: InfoMsg, _state: &mut ()) -> Commands {
        if let InfoMsg::ChildExit { exit, .. } = msg {
            self.exits.lock().unwrap().push(exit);
        }
        Vec::new()
    }
}

#[tokio::test]
async fn child_exits_come_back_as_info() {
    let exits = Arc::new(Mutex::new(Vec::new()));
    let peer = connect(Nursery { exits: exits.clone() });
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));

    // Give the child and its watcher a chance to run.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (result, _) = peer.close().await;
    result.unwrap();
    assert_eq!(exits.lock().unwrap().clone(), vec![ChildExit::Normal]);
}

#[tokio::test]
async fn error_response_is_dropped_after_a_response() {
    struct DoubleError;
    impl StreamHandler for DoubleError {
        type State = ();
        fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
            (
                vec![
                    Command::Response(StatusCode::OK, HeaderMap::new(), Body::from("first")),
                    Command::ErrorResponse(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        HeaderMap::new(),
                        Body::from("second"),
                    ),
                ],
                (),
            )
        }
        fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
            Vec::new()
        }
    }

    let peer = connect(DoubleError);
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let (result, ops) = peer.close().await;
    result.unwrap();

    let (wire, _) = stream_writes(&ops, 0);
    let frames = parse_wire(wire);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].status(), Some("200"));
}

#[tokio::test]
async fn second_control_stream_kills_the_connection() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_control(2);
    peer.open_control(6);
    let (result, _) = peer.finished().await;
    assert_matches!(result.unwrap_err().reason(), Reason::ConnectionError(code, _) => {
        assert_eq!(*code, Code::H3_STREAM_CREATION_ERROR);
    });
}

#[tokio::test]
async fn closing_the_control_stream_kills_the_connection() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_control(2);
    peer.event(crate::transport::TransportEvent::StreamClosed { id: sid(2) });
    let (result, _) = peer.finished().await;
    assert_matches!(result.unwrap_err().reason(), Reason::ConnectionError(code, _) => {
        assert_eq!(*code, Code::H3_CLOSED_CRITICAL_STREAM);
    });
}

#[tokio::test]
async fn connection_close_terminates_live_handlers() {
    let terminated = Arc::new(AtomicBool::new(false));
    struct Holder {
        terminated: Arc<AtomicBool>,
    }
    impl StreamHandler for Holder {
        type State = ();
        fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
            (Vec::new(), ())
        }
        fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
            Vec::new()
        }
        fn terminate(&self, _id: StreamId, _reason: &Reason, _state: ()) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    let peer = connect(Holder { terminated: terminated.clone() });
    peer.open_bidi(0);
    peer.data(0, Fin::NoFin, headers_frame(get_request("/")));
    let (result, _) = peer.close().await;
    result.unwrap();
    assert!(terminated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn buffered_partial_frames_are_reassembled() {
    let peer = connect(Respond::with(StatusCode::OK, "hi"));
    peer.open_bidi(0);
    let frame = headers_frame(get_request("/"));
    let (left, right) = frame.split_at(3);
    peer.data(0, Fin::NoFin, Bytes::copy_from_slice(left));
    peer.data(0, Fin::Fin, Bytes::copy_from_slice(right));
    let (result, ops) = peer.close().await;
    result.unwrap();

    let (wire, fin) = stream_writes(&ops, 0);
    assert!(fin);
    assert_eq!(parse_wire(wire)[0].status(), Some("200"));
}

#[tokio::test]
async fn set_options_flow_and_log_are_accepted() {
    struct Quiet;
    impl StreamHandler for Quiet {
        type State = ();
        fn init(&self, _id: StreamId, _req: Request) -> (Commands, ()) {
            (
                vec![
                    Command::SetOptions(crate::handler::StreamOptions::default()),
                    Command::Flow(65_536),
                    Command::Log(crate::handler::LogEntry {
                        level: tracing::Level::DEBUG,
                        message: "handled".into(),
                    }),
                    Command::Response(StatusCode::NO_CONTENT, empty_headers(), Body::empty()),
                ],
                (),
            )
        }
        fn data(&self, _id: StreamId, _fin: Fin, _data: Bytes, _state: &mut ()) -> Commands {
            Vec::new()
        }
    }

    let peer = connect(Quiet);
    peer.open_bidi(0);
    peer.data(0, Fin::Fin, headers_frame(get_request("/")));
    let (result, ops) = peer.close().await;
    result.unwrap();

    let (wire, fin) = stream_writes(&ops, 0);
    assert!(fin);
    assert_eq!(parse_wire(wire)[0].status(), Some("204"));
}
