//! Stream reader
//!
//! Merges the two persisted halves of a connection back into one ordered
//! payload sequence. Blocks are emitted in timestamp order with the client
//! side winning ties, metadata is parsed per contiguous same-side run, and
//! `skip`/`limit` paginate over a running global byte index.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CaronteError, Result};
use crate::models::{ConnectionStream, PatternSlice, RowId};
use crate::parsers::{self, Metadata};
use crate::storage::Storage;

use super::format::decode_bytes;
use super::CancelToken;

pub const DEFAULT_QUERY_LIMIT: u64 = 8024;

/// Query parameters of one stream read
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryFormat {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub skip: u64,
    #[serde(default)]
    pub limit: u64,
}

/// A pattern occurrence rewritten relative to one payload block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexSlice {
    pub from: u64,
    pub to: u64,
}

/// One merged block served to the analyst
#[derive(Debug, Clone, Serialize)]
pub struct Payload {
    pub from_client: bool,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub is_metadata_continuation: bool,
    /// Block start offset within its side's full stream
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub is_retransmitted: bool,
    pub regex_matches: Vec<RegexSlice>,
}

/// Cursor over one side's chunk documents
struct SideCursor {
    from_client: bool,
    stream: Option<ConnectionStream>,
    document_index: usize,
    block_index: usize,
    /// Bytes of this side consumed so far (global offset)
    side_index: u64,
}

impl SideCursor {
    fn has_blocks(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|s| self.block_index < s.blocks_indexes.len())
    }

    fn current_timestamp(&self) -> Option<DateTime<Utc>> {
        self.stream
            .as_ref()
            .and_then(|s| s.blocks_timestamps.get(self.block_index))
            .copied()
    }
}

#[derive(Clone)]
pub struct StreamReader {
    storage: Storage,
    default_limit: u64,
}

impl StreamReader {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            default_limit: DEFAULT_QUERY_LIMIT,
        }
    }

    pub fn with_default_limit(storage: Storage, default_limit: u64) -> Self {
        Self {
            storage,
            default_limit,
        }
    }

    /// Merge both sides of a connection into ordered payloads.
    pub fn get_connection_payload(
        &self,
        connection_id: RowId,
        query: &QueryFormat,
        cancel: &CancelToken,
    ) -> Result<Vec<Payload>> {
        let limit = if query.limit == 0 {
            self.default_limit
        } else {
            query.limit
        };
        let skip = query.skip;

        let mut client = self.open_side(connection_id, true)?;
        let mut server = self.open_side(connection_id, false)?;

        let mut payloads: Vec<Payload> = Vec::new();
        let mut global_index: u64 = 0;

        // Current same-side run, parsed as one metadata chunk
        let mut run: Vec<(Payload, bool)> = Vec::new();
        let mut run_content: Vec<u8> = Vec::new();
        let mut run_from_client = false;

        while client.stream.is_some() || server.stream.is_some() {
            if cancel.is_cancelled() {
                // A cancelled read keeps its prefix only once past `skip`
                if global_index > skip {
                    flush_run(&mut run, &mut run_content, &mut payloads);
                    return Ok(payloads);
                }
                return Ok(Vec::new());
            }

            let take_client = client.has_blocks()
                && (!server.has_blocks()
                    || client.current_timestamp() <= server.current_timestamp());

            let side = if take_client { &mut client } else { &mut server };
            if !side.has_blocks() {
                return Err(CaronteError::Internal(format!(
                    "connection {}: cursor on exhausted side",
                    connection_id
                )));
            }

            let (payload, content) = emit_block(side, &query.format);
            let size = content.len() as u64;
            global_index += size;

            let from_client = payload.from_client;
            let emit = global_index > skip;

            if !run.is_empty() && run_from_client != from_client {
                flush_run(&mut run, &mut run_content, &mut payloads);
            }
            run_from_client = from_client;
            run.push((payload, emit));
            run_content.extend_from_slice(&content);

            self.advance(&mut client)?;
            self.advance(&mut server)?;

            if client.stream.is_none() && server.stream.is_none() {
                flush_run(&mut run, &mut run_content, &mut payloads);
            }

            if global_index > skip + limit {
                flush_run(&mut run, &mut run_content, &mut payloads);
                return Ok(payloads);
            }
        }

        flush_run(&mut run, &mut run_content, &mut payloads);
        Ok(payloads)
    }

    fn open_side(&self, connection_id: RowId, from_client: bool) -> Result<SideCursor> {
        let stream = self.load_chunk(connection_id, from_client, 0)?;
        Ok(SideCursor {
            from_client,
            stream,
            document_index: 0,
            block_index: 0,
            side_index: 0,
        })
    }

    /// Move to the next document once the current one is exhausted.
    fn advance(&self, side: &mut SideCursor) -> Result<()> {
        if side.stream.is_some() && !side.has_blocks() {
            let connection_id = side.stream.as_ref().unwrap().connection_id;
            side.document_index += 1;
            side.block_index = 0;
            side.stream = self.load_chunk(connection_id, side.from_client, side.document_index)?;
        }
        Ok(())
    }

    fn load_chunk(
        &self,
        connection_id: RowId,
        from_client: bool,
        document_index: usize,
    ) -> Result<Option<ConnectionStream>> {
        let chunk = self
            .storage
            .get_stream_chunk(connection_id, from_client, document_index)?;
        if let Some(chunk) = &chunk {
            if !chunk.check_invariants() {
                return Err(CaronteError::Internal(format!(
                    "connection {} side {} document {}: block arrays violate invariants",
                    connection_id, from_client, document_index
                )));
            }
        }
        Ok(chunk)
    }
}

/// Build the payload for the cursor's current block and step past it.
fn emit_block(side: &mut SideCursor, format: &str) -> (Payload, Vec<u8>) {
    let stream = side.stream.as_ref().expect("cursor has a stream");
    let start = stream.blocks_indexes[side.block_index];
    let end = if side.block_index + 1 < stream.blocks_indexes.len() {
        stream.blocks_indexes[side.block_index + 1]
    } else {
        stream.payload.len()
    };
    let content = stream.payload[start..end].to_vec();
    let size = content.len() as u64;

    let payload = Payload {
        from_client: side.from_client,
        content: decode_bytes(&content, format),
        metadata: None,
        is_metadata_continuation: false,
        index: side.side_index,
        timestamp: stream.blocks_timestamps[side.block_index],
        is_retransmitted: stream.blocks_loss[side.block_index],
        regex_matches: matches_between(
            &stream.pattern_matches,
            side.side_index,
            side.side_index + size,
        ),
    };

    side.side_index += size;
    side.block_index += 1;
    (payload, content)
}

/// Parse the run's concatenated bytes and flush its payloads in order.
/// Metadata lands on the first payload; the rest are continuations.
fn flush_run(
    run: &mut Vec<(Payload, bool)>,
    run_content: &mut Vec<u8>,
    payloads: &mut Vec<Payload>,
) {
    if run.is_empty() {
        run_content.clear();
        return;
    }

    let metadata = parsers::parse(run_content);
    let mut first = true;
    for (mut payload, emit) in run.drain(..) {
        if first {
            payload.metadata = metadata.clone();
            first = false;
        } else {
            payload.is_metadata_continuation = true;
        }
        if emit {
            payloads.push(payload);
        }
    }
    run_content.clear();
}

/// Rewrite the side's flow-global matches overlapping `[from, to)` into
/// block-relative slices clamped to the block.
fn matches_between(
    pattern_matches: &HashMap<u64, Vec<PatternSlice>>,
    from: u64,
    to: u64,
) -> Vec<RegexSlice> {
    let mut slices = Vec::new();
    for occurrences in pattern_matches.values() {
        for &(start, end) in occurrences {
            if from >= end || to <= start {
                continue;
            }
            slices.push(RegexSlice {
                from: start.saturating_sub(from),
                to: end.min(to) - from,
            });
        }
    }
    slices.sort_by_key(|s| (s.from, s.to));
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    struct SeedChunk {
        from_client: bool,
        document_index: usize,
        payload: &'static [u8],
        blocks: Vec<(usize, i64, bool)>,
        matches: Vec<(u64, (u64, u64))>,
    }

    fn seed(storage: &Storage, chunks: Vec<SeedChunk>) {
        for seed in chunks {
            let mut pattern_matches: HashMap<u64, Vec<PatternSlice>> = HashMap::new();
            for (pattern, slice) in seed.matches {
                pattern_matches.entry(pattern).or_default().push(slice);
            }
            storage
                .insert_stream_chunk(&ConnectionStream {
                    id: storage.next_row_id().unwrap(),
                    connection_id: RowId(1),
                    from_client: seed.from_client,
                    document_index: seed.document_index,
                    payload: seed.payload.to_vec(),
                    blocks_indexes: seed.blocks.iter().map(|b| b.0).collect(),
                    blocks_timestamps: seed.blocks.iter().map(|b| ts(b.1)).collect(),
                    blocks_loss: seed.blocks.iter().map(|b| b.2).collect(),
                    pattern_matches,
                    scanned_version: 1,
                })
                .unwrap();
        }
    }

    fn read(storage: &Storage, query: &QueryFormat) -> Vec<Payload> {
        StreamReader::new(storage.clone())
            .get_connection_payload(RowId(1), query, &CancelToken::new())
            .unwrap()
    }

    #[test]
    fn test_http_exchange_with_metadata() {
        let storage = Storage::open_memory().unwrap();
        seed(
            &storage,
            vec![
                SeedChunk {
                    from_client: true,
                    document_index: 0,
                    payload: b"GET /flag HTTP/1.1\r\nHost: x\r\n\r\n",
                    blocks: vec![(0, 0, false)],
                    matches: vec![],
                },
                SeedChunk {
                    from_client: false,
                    document_index: 0,
                    payload: b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nCTF{",
                    blocks: vec![(0, 10, false)],
                    matches: vec![],
                },
            ],
        );

        let payloads = read(&storage, &QueryFormat::default());
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
    fn test_tie_break_client_first() {
        let storage = Storage::open_memory().unwrap();
        seed(
            &storage,
            vec![
                SeedChunk {
                    from_client: true,
                    document_index: 0,
                    payload: b"client",
                    blocks: vec![(0, 500, false)],
                    matches: vec![],
                },
                SeedChunk {
                    from_client: false,
                    document_index: 0,
                    payload: b"server",
                    blocks: vec![(0, 500, false)],
                    matches: vec![],
                },
            ],
        );

        let payloads = read(&storage, &QueryFormat::default());
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].from_client);
        assert!(!payloads[1].from_client);
    }

    #[test]
    fn test_timestamp_order_and_indexes() {
        let storage = Storage::open_memory().unwrap();
        seed(
            &storage,
            vec![
                SeedChunk {
                    from_client: true,
                    document_index: 0,
                    payload: b"aabb",
                    blocks: vec![(0, 0, false), (2, 300, false)],
                    matches: vec![],
                },
                SeedChunk {
                    from_client: false,
                    document_index: 0,
                    payload: b"xxyy",
                    blocks: vec![(0, 100, false), (2, 200, false)],
                    matches: vec![],
                },
            ],
        );

        let payloads = read(&storage, &QueryFormat::default());
        let order: Vec<(bool, u64)> = payloads.iter().map(|p| (p.from_client, p.index)).collect();
        assert_eq!(
            order,
            vec![(true, 0), (false, 0), (false, 2), (true, 2)]
        );

        // timestamps never decrease
        assert!(payloads.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_merge_across_documents() {
        let storage = Storage::open_memory().unwrap();
        seed(
            &storage,
            vec![
                SeedChunk {
                    from_client: true,
                    document_index: 0,
                    payload: b"first",
                    blocks: vec![(0, 0, false)],
                    matches: vec![],
                },
                SeedChunk {
                    from_client: true,
                    document_index: 1,
                    payload: b"second",
                    blocks: vec![(0, 400, false)],
                    matches: vec![],
                },
            ],
        );

        let payloads = read(&storage, &QueryFormat::default());
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].index, 0);
        assert_eq!(payloads[1].index, 5);
        assert_eq!(payloads[1].content, "second");
    }

    #[test]
    fn test_regex_matches_block_relative() {
        let storage = Storage::open_memory().unwrap();
        // "..CTF{x}.." with match at side offsets 2..8
        seed(
            &storage,
            vec![SeedChunk {
                from_client: false,
                document_index: 0,
                payload: b"..CTF{x}..",
                blocks: vec![(0, 0, false)],
                matches: vec![(0, (2, 8))],
            }],
        );

        let payloads = read(&storage, &QueryFormat::default());
        assert_eq!(payloads[0].regex_matches, vec![RegexSlice { from: 2, to: 8 }]);
    }

    #[test]
    fn test_match_clamped_to_block() {
        let storage = Storage::open_memory().unwrap();
        // two blocks of 5; the match spans offsets 3..7 across both
        seed(
            &storage,
            vec![SeedChunk {
                from_client: true,
                document_index: 0,
                payload: b"aaaaabbbbb",
                blocks: vec![(0, 0, false), (5, 300, false)],
                matches: vec![(0, (3, 7))],
            }],
        );

        let payloads = read(&storage, &QueryFormat::default());
        assert_eq!(payloads[0].regex_matches, vec![RegexSlice { from: 3, to: 5 }]);
        assert_eq!(payloads[1].regex_matches, vec![RegexSlice { from: 0, to: 2 }]);
    }

    #[test]
    fn test_retransmission_flag_surfaces() {
        let storage = Storage::open_memory().unwrap();
        seed(
            &storage,
            vec![SeedChunk {
                from_client: true,
                document_index: 0,
                payload: b"resent",
                blocks: vec![(0, 0, true)],
                matches: vec![],
            }],
        );

        let payloads = read(&storage, &QueryFormat::default());
        assert!(payloads[0].is_retransmitted);
    }

    #[test]
    fn test_skip_and_limit() {
        let storage = Storage::open_memory().unwrap();
        seed(
            &storage,
            vec![SeedChunk {
                from_client: true,
                document_index: 0,
                payload: b"aaaabbbbcccc",
                blocks: vec![(0, 0, false), (4, 300, false), (8, 600, false)],
                matches: vec![],
            }],
        );

        // skip the first block entirely
        let skipped = read(
            &storage,
            &QueryFormat { format: String::new(), skip: 4, limit: 0 },
        );
        assert_eq!(skipped.len(), 2);
        assert_eq!(skipped[0].content, "bbbb");

        // limit stops after the crossing block
        let limited = read(
            &storage,
            &QueryFormat { format: String::new(), skip: 0, limit: 5 },
        );
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].content, "bbbb");
    }

    #[test]
    fn test_metadata_continuation_run() {
        let storage = Storage::open_memory().unwrap();
        // request split over two client blocks, then a server response
        seed(
            &storage,
            vec![
                SeedChunk {
                    from_client: true,
                    document_index: 0,
                    payload: b"GET /flag HTTP/1.1\r\nHost: x\r\n\r\n",
                    blocks: vec![(0, 0, false), (10, 300, false)],
                    matches: vec![],
                },
                SeedChunk {
                    from_client: false,
                    document_index: 0,
                    payload: b"HTTP/1.1 200 OK\r\n\r\n",
                    blocks: vec![(0, 900, false)],
                    matches: vec![],
                },
            ],
        );

        let payloads = read(&storage, &QueryFormat::default());
        assert_eq!(payloads.len(), 3);

        // the run's metadata sits on its first payload only
        assert!(payloads[0].metadata.is_some());
        assert!(!payloads[0].is_metadata_continuation);
        assert!(payloads[1].metadata.is_none());
        assert!(payloads[1].is_metadata_continuation);
        assert!(payloads[2].metadata.is_some());
    }

    #[test]
    fn test_missing_connection_is_empty() {
        let storage = Storage::open_memory().unwrap();
        let payloads = read(&storage, &QueryFormat::default());
        assert!(payloads.is_empty());
    }

    #[test]
    fn test_corrupt_chunk_is_internal_error() {
        let storage = Storage::open_memory().unwrap();
        seed(
            &storage,
            vec![SeedChunk {
                from_client: true,
                document_index: 0,
                payload: b"data",
                blocks: vec![(0, 0, false), (2, 10, false)],
                matches: vec![],
            }],
        );
        // corrupt the parallel arrays
        storage
            .insert_stream_chunk(&ConnectionStream {
                id: storage.next_row_id().unwrap(),
                connection_id: RowId(2),
                from_client: true,
                document_index: 0,
                payload: b"data".to_vec(),
                blocks_indexes: vec![0, 9],
                blocks_timestamps: vec![ts(0), ts(1)],
                blocks_loss: vec![false, false],
                pattern_matches: HashMap::new(),
                scanned_version: 1,
            })
            .unwrap();

        let reader = StreamReader::new(storage.clone());
        let result =
            reader.get_connection_payload(RowId(2), &QueryFormat::default(), &CancelToken::new());
        assert!(matches!(result, Err(CaronteError::Internal(_))));
    }

    #[test]
    fn test_cancelled_before_skip_returns_empty() {
        let storage = Storage::open_memory().unwrap();
        seed(
            &storage,
            vec![SeedChunk {
                from_client: true,
                document_index: 0,
                payload: b"payload",
                blocks: vec![(0, 0, false)],
                matches: vec![],
            }],
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        let payloads = StreamReader::new(storage.clone())
            .get_connection_payload(RowId(1), &QueryFormat { skip: 100, ..Default::default() }, &cancel)
            .unwrap();
        assert!(payloads.is_empty());
    }
}
