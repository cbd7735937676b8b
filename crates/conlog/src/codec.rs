//! Line encoding for the durable log.
//!
//! One record per line:
//!
//! ```text
//! severity|timestamp|base64(content)|base64(detail)|sequence
//! ```
//!
//! Content and detail are base64 encoded so that newlines and `|` inside
//! them cannot break the line framing. The trailing sequence field is
//! optional; records written before it existed decode with sequence 0.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{ConsoleError, Result};
use crate::types::{Entry, Severity};

/// Field delimiter. Never produced by the base64 alphabet.
pub const DELIMITER: char = '|';

/// Encodes an entry as a single line, without the trailing newline.
#[must_use]
pub fn encode_record(entry: &Entry) -> String {
    encode_fields(
        entry.severity,
        &entry.timestamp,
        &entry.content,
        &entry.detail,
        entry.sequence,
    )
}

/// Encodes raw fields as a single line, without the trailing newline.
#[must_use]
pub fn encode_fields(
    severity: Severity,
    timestamp: &str,
    content: &str,
    detail: &str,
    sequence: u64,
) -> String {
    // The timestamp is written verbatim; strip anything that would break framing.
    let timestamp: String = timestamp
        .chars()
        .filter(|c| *c != DELIMITER && *c != '\n' && *c != '\r')
        .collect();
    format!(
        "{}{DELIMITER}{timestamp}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{sequence}",
        severity.as_int(),
        STANDARD.encode(content),
        STANDARD.encode(detail),
    )
}

/// Decodes one line into an un-numbered entry.
///
/// # Errors
///
/// Returns [`ConsoleError::MalformedRecord`] when the field count, severity,
/// base64 payloads or sequence are invalid.
pub fn decode_record(line: &str) -> Result<Entry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split(DELIMITER).collect();
    if fields.len() != 4 && fields.len() != 5 {
        return Err(ConsoleError::MalformedRecord(format!(
            "expected 4 or 5 fields, found {}",
            fields.len()
        )));
    }

    let severity = fields[0]
        .parse::<u8>()
        .ok()
        .and_then(Severity::from_int)
        .ok_or_else(|| ConsoleError::MalformedRecord(format!("bad severity '{}'", fields[0])))?;
    let timestamp = fields[1].to_string();
    let content = decode_text(fields[2], "content")?;
    let detail = decode_text(fields[3], "detail")?;
    let sequence = match fields.get(4) {
        Some(raw) if !raw.is_empty() => raw
            .parse::<u64>()
            .map_err(|_| ConsoleError::MalformedRecord(format!("bad sequence '{raw}'")))?,
        _ => 0,
    };

    Ok(Entry::new(content, detail, severity, timestamp, sequence))
}

fn decode_text(field: &str, name: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(field)
        .map_err(|e| ConsoleError::MalformedRecord(format!("{name}: {e}")))?;
    String::from_utf8(bytes).map_err(|e| ConsoleError::MalformedRecord(format!("{name}: {e}")))
}
