//! End-to-end pipeline tests: packets through the assembler, persister and
//! finalizer, read back through the stream reader.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use caronte::assembly::{Assembler, AssemblyConfig, CompletedFlow};
use caronte::core::packet::{Packet, TcpFlags};
use caronte::models::RowId;
use caronte::parsers::Metadata;
use caronte::persist::{Persister, PersisterConfig};
use caronte::rules::{Pattern, PatternDirection, PatternFlags, Rule, RuleRegistry};
use caronte::storage::Storage;
use caronte::streams::{CancelToken, QueryFormat, StreamReader};

const CLIENT: (&str, u16) = ("192.168.1.100", 43210);
const SERVER: (&str, u16) = ("10.0.0.1", 8080);

struct Pipeline {
    storage: Storage,
    registry: Arc<RuleRegistry>,
    assembler: Assembler,
    completed_rx: mpsc::UnboundedReceiver<CompletedFlow>,
}

impl Pipeline {
    fn new() -> Self {
        let storage = Storage::open_memory().unwrap();
        let registry = Arc::new(RuleRegistry::open(storage.clone()).unwrap());
        let (tx, completed_rx) = mpsc::unbounded_channel();
        let assembler = Assembler::new(AssemblyConfig::default(), storage.clone(), tx);
        Self {
            storage,
            registry,
            assembler,
            completed_rx,
        }
    }

    fn add_rule(&self, name: &str, regex: &str) -> RowId {
        self.registry
            .add_rule(Rule {
                id: RowId::ZERO,
                name: name.into(),
                color: "#e53935".into(),
                notes: String::new(),
                enabled: true,
                patterns: vec![Pattern {
                    regex: regex.into(),
                    flags: PatternFlags {
                        direction: PatternDirection::Both,
                        ..Default::default()
                    },
                }],
                version: 0,
            })
            .unwrap()
    }

    /// Drain completed flows through the persister.
    fn persist_completed(&mut self) -> Vec<RowId> {
        let persister = Persister::new(
            self.storage.clone(),
            self.registry.clone(),
            PersisterConfig::default(),
        );
        let mut ids = Vec::new();
        while let Ok(flow) = self.completed_rx.try_recv() {
            ids.push(persister.persist_flow(flow).unwrap());
        }
        ids
    }

    fn read(&self, connection_id: RowId) -> Vec<caronte::streams::Payload> {
        StreamReader::new(self.storage.clone())
            .get_connection_payload(connection_id, &QueryFormat::default(), &CancelToken::new())
            .unwrap()
    }
}

fn packet(
    src: (&str, u16),
    dst: (&str, u16),
    seq: u32,
    flags: TcpFlags,
    payload: &[u8],
    millis: i64,
) -> Packet {
    Packet {
        timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
        src_ip: src.0.parse().unwrap(),
        dst_ip: dst.0.parse().unwrap(),
        src_port: src.1,
        dst_port: dst.1,
        seq,
        ack: 0,
        flags,
        payload: payload.to_vec(),
    }
}

fn syn() -> TcpFlags {
    TcpFlags { syn: true, ..Default::default() }
}

fn syn_ack() -> TcpFlags {
    TcpFlags { syn: true, ack: true, ..Default::default() }
}

fn psh_ack() -> TcpFlags {
    TcpFlags { psh: true, ack: true, ..Default::default() }
}

fn fin_ack() -> TcpFlags {
    TcpFlags { fin: true, ack: true, ..Default::default() }
}

/// Run one complete request/response exchange through the assembler.
fn run_http_exchange(pipeline: &Pipeline, request: &[u8], response: &[u8]) {
    let a = &pipeline.assembler;
    a.handle_packet(packet(CLIENT, SERVER, 0, syn(), b"", 0)).unwrap();
    a.handle_packet(packet(SERVER, CLIENT, 0, syn_ack(), b"", 1)).unwrap();
    a.handle_packet(packet(CLIENT, SERVER, 1, psh_ack(), request, 10)).unwrap();
    a.handle_packet(packet(SERVER, CLIENT, 1, psh_ack(), response, 20)).unwrap();
    a.handle_packet(packet(CLIENT, SERVER, 1 + request.len() as u32, fin_ack(), b"", 30))
        .unwrap();
    a.handle_packet(packet(SERVER, CLIENT, 1 + response.len() as u32, fin_ack(), b"", 31))
        .unwrap();
}

#[test]
fn test_http_get_round_trip() {
    let mut pipeline = Pipeline::new();
    let request = b"GET /flag HTTP/1.1\r\nHost: x\r\n\r\n";
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nCTF{";

    run_http_exchange(&pipeline, request, response);
    let ids = pipeline.persist_completed();
    assert_eq!(ids.len(), 1);

    let payloads = pipeline.read(ids[0]);
    assert_eq!(payloads.len(), 2);

    assert!(payloads[0].from_client);
    match payloads[0].metadata.as_ref().unwrap() {
        Metadata::HttpRequest { method, url, .. } => {
            assert_eq!(method, "GET");
            assert_eq!(url, "/flag");
        }
        other => panic!("expected request metadata, got {:?}", other),
    }

    assert!(!payloads[1].from_client);
    match payloads[1].metadata.as_ref().unwrap() {
        Metadata::HttpResponse { status, body, .. } => {
            assert_eq!(status, "200 OK");
            assert_eq!(body, "CTF{");
        }
        other => panic!("expected response metadata, got {:?}", other),
    }
}

#[test]
fn test_flag_rule_matches_connection() {
    let mut pipeline = Pipeline::new();
    let rule_id = pipeline.add_rule("flag out", r"CTF\{[A-Za-z0-9]+\}");

    let response = b"HTTP/1.1 200 OK\r\n\r\nhere: CTF{abc123} done";
    run_http_exchange(&pipeline, b"GET / HTTP/1.1\r\n\r\n", response);
    let ids = pipeline.persist_completed();

    let connection = pipeline.storage.get_connection(ids[0]).unwrap().unwrap();
    assert_eq!(connection.matched_rules, vec![rule_id]);

    // the reader rewrites the match relative to the enclosing payload
    let payloads = pipeline.read(ids[0]);
    let server_payload = payloads.iter().find(|p| !p.from_client).unwrap();
    assert_eq!(server_payload.regex_matches.len(), 1);
    let m = server_payload.regex_matches[0];
    let matched = &server_payload.content[m.from as usize..m.to as usize];
    assert_eq!(matched, "CTF{abc123}");
}

#[test]
fn test_connection_aggregates() {
    let mut pipeline = Pipeline::new();
    let request = b"ping";
    let response = b"pong!";

    run_http_exchange(&pipeline, request, response);
    let ids = pipeline.persist_completed();

    let connection = pipeline.storage.get_connection(ids[0]).unwrap().unwrap();
    assert_eq!(connection.client_bytes, request.len() as u64);
    assert_eq!(connection.server_bytes, response.len() as u64);
    assert!(connection.started_at <= connection.closed_at);
    assert_eq!(connection.service_port, SERVER.1);
    assert_eq!(connection.ip_src.to_string(), CLIENT.0);

    // byte totals equal the persisted chunk payload sum
    let chunk_sum: usize = [true, false]
        .iter()
        .flat_map(|&side| pipeline.storage.stream_chunks(ids[0], side).unwrap())
        .map(|c| c.payload.len())
        .sum();
    assert_eq!(connection.total_bytes(), chunk_sum as u64);
}

#[test]
fn test_half_stream_concatenation_equals_original() {
    let mut pipeline = Pipeline::new();

    // response large enough for several chunks with an 8 KiB budget
    let response: Vec<u8> = (0..40_000).map(|i| (i % 251) as u8).collect();

    let a = &pipeline.assembler;
    a.handle_packet(packet(CLIENT, SERVER, 0, syn(), b"", 0)).unwrap();
    a.handle_packet(packet(SERVER, CLIENT, 0, syn_ack(), b"", 1)).unwrap();
    let mut seq = 1u32;
    for segment in response.chunks(1400) {
        a.handle_packet(packet(SERVER, CLIENT, seq, psh_ack(), segment, 10)).unwrap();
        seq += segment.len() as u32;
    }
    a.handle_packet(packet(CLIENT, SERVER, 1, fin_ack(), b"", 20)).unwrap();
    a.handle_packet(packet(SERVER, CLIENT, seq, fin_ack(), b"", 21)).unwrap();

    let persister = Persister::new(
        pipeline.storage.clone(),
        pipeline.registry.clone(),
        PersisterConfig {
            max_chunk_bytes: 8 * 1024,
            ..Default::default()
        },
    );
    let flow = pipeline.completed_rx.try_recv().unwrap();
    let id = persister.persist_flow(flow).unwrap();

    let chunks = pipeline.storage.stream_chunks(id, false).unwrap();
    assert!(chunks.len() > 1);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.document_index, i);
        assert!(chunk.check_invariants());
    }

    let reassembled: Vec<u8> = chunks.into_iter().flat_map(|c| c.payload).collect();
    assert_eq!(reassembled, response);
}

#[test]
fn test_out_of_order_segments_read_back_in_order() {
    let mut pipeline = Pipeline::new();

    let a = &pipeline.assembler;
    a.handle_packet(packet(CLIENT, SERVER, 0, syn(), b"", 0)).unwrap();
    a.handle_packet(packet(SERVER, CLIENT, 0, syn_ack(), b"", 1)).unwrap();
    // second half arrives first
    a.handle_packet(packet(CLIENT, SERVER, 7, psh_ack(), b"world!", 11)).unwrap();
    a.handle_packet(packet(CLIENT, SERVER, 1, psh_ack(), b"hello ", 10)).unwrap();
    a.handle_packet(packet(CLIENT, SERVER, 13, fin_ack(), b"", 20)).unwrap();
    a.handle_packet(packet(SERVER, CLIENT, 1, fin_ack(), b"", 21)).unwrap();

    let ids = pipeline.persist_completed();
    let payloads = pipeline.read(ids[0]);

    let text: String = payloads
        .iter()
        .filter(|p| p.from_client)
        .map(|p| p.content.clone())
        .collect();
    assert_eq!(text, "hello world!");

    // per-side indexes strictly increase
    let indexes: Vec<u64> = payloads.iter().filter(|p| p.from_client).map(|p| p.index).collect();
    assert!(indexes.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_rule_added_after_connection_not_matched_until_rescan() {
    let mut pipeline = Pipeline::new();

    run_http_exchange(
        &pipeline,
        b"GET / HTTP/1.1\r\n\r\n",
        b"HTTP/1.1 200 OK\r\n\r\nCTF{late}",
    );
    let ids = pipeline.persist_completed();

    // rule arrives after finalization
    pipeline.add_rule("late", r"CTF\{[a-z]+\}");

    let connection = pipeline.storage.get_connection(ids[0]).unwrap().unwrap();
    assert!(connection.matched_rules.is_empty());
}
