//! Payload display formats
//!
//! Decodes raw payload bytes into the representation requested by the query.
//! An unrecognized format name falls back to `default`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Decode bytes for display in the given format.
pub fn decode_bytes(bytes: &[u8], format: &str) -> String {
    match format {
        "hex" => to_hex(bytes),
        "hexdump" => to_hexdump(bytes),
        "base32" => to_base32(bytes),
        "base64" => BASE64.encode(bytes),
        "ascii" => to_ascii(bytes),
        "binary" => radix_words(bytes, 2),
        "decimal" => radix_words(bytes, 10),
        "octal" => radix_words(bytes, 8),
        _ => to_default(bytes),
    }
}

/// UTF-8-ish pass-through: printable ASCII, tabs and line breaks survive;
/// everything else becomes a `\xNN` escape.
fn to_default(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\n' | b'\r' | b'\t' => out.push(b as char),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Classic 16-bytes-per-row dump with offsets and an ASCII gutter
fn to_hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", row * 16));
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => out.push_str(&format!("{:02x} ", b)),
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &b in chunk {
            out.push(if (0x20..=0x7e).contains(&b) { b as char } else { '.' });
        }
        out.push_str("|\n");
    }
    out
}

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32 with padding
fn to_base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    for group in bytes.chunks(5) {
        let mut buf = [0u8; 5];
        buf[..group.len()].copy_from_slice(group);

        let bits = u64::from(buf[0]) << 32
            | u64::from(buf[1]) << 24
            | u64::from(buf[2]) << 16
            | u64::from(buf[3]) << 8
            | u64::from(buf[4]);

        let chars = match group.len() {
            1 => 2,
            2 => 4,
            3 => 5,
            4 => 7,
            _ => 8,
        };
        for i in 0..8 {
            if i < chars {
                let index = ((bits >> (35 - i * 5)) & 0x1f) as usize;
                out.push(BASE32_ALPHABET[index] as char);
            } else {
                out.push('=');
            }
        }
    }
    out
}

fn to_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '.' })
        .collect()
}

fn radix_words(bytes: &[u8], radix: u32) -> String {
    let words: Vec<String> = bytes
        .iter()
        .map(|&b| match radix {
            2 => format!("{:08b}", b),
            8 => format!("{:03o}", b),
            _ => format!("{}", b),
        })
        .collect();
    words.join(" ")
}

/// Serde adapter encoding byte payloads as base64 strings in JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        String::serialize(&BASE64.encode(v), s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
