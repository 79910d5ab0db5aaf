//! Line-delimited JSON-RPC transport.
//!
//! One JSON object per line in both directions. Blank lines are skipped and
//! malformed frames are logged and dropped so a single bad message never
//! tears down the serve loop. The codec is BSON-aware: helpers here convert
//! between `serde_json::Value` frames (which may carry extended JSON such as
//! `{"$oid": …}` and `{"$date": …}`) and the `bson` types handed to the
//! driver, preserving ObjectId and date representations in both directions.

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin, Stdout};

/// One duplex message stream speaking line-delimited JSON-RPC.
#[async_trait]
pub trait Transport: Send {
    /// Read the next well-formed frame; `None` on end of stream.
    async fn read_message(&mut self) -> Option<Value>;

    /// Write one frame. Failures are logged, never propagated.
    async fn write_message(&mut self, msg: &Value);
}

/// Transport over the process stdin/stdout pair (the stdio host mode).
pub struct StdioTransport {
    reader: BufReader<Stdin>,
    writer: Stdout,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            writer: tokio::io::stdout(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn read_message(&mut self) -> Option<Value> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    log::error!("Error reading line from transport: {}", e);
                    return None;
                }
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(trimmed) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    log::warn!("Failed to parse JSON-RPC frame {:?}: {}", trimmed, e);
                    continue;
                }
            }
        }
    }

    async fn write_message(&mut self, msg: &Value) {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize frame: {}", e);
                return;
            }
        };
        if let Err(e) = self.writer.write_all(text.as_bytes()).await {
            log::error!("Error writing frame to transport: {}", e);
            return;
        }
        if let Err(e) = self.writer.write_all(b"\n").await {
            log::error!("Error writing frame delimiter: {}", e);
            return;
        }
        let _ = self.writer.flush().await;
    }
}

/// Parse a JSON value (possibly carrying extended JSON) into a [`Bson`] value.
pub fn json_to_bson(value: &Value) -> Result<Bson, String> {
    Bson::try_from(value.clone()).map_err(|e| format!("invalid extended JSON: {}", e))
}

/// Parse a JSON object into a BSON [`Document`]; non-objects are rejected.
pub fn json_to_document(value: &Value) -> Result<Document, String> {
    match json_to_bson(value)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(format!("expected a document, got {}", other)),
    }
}

/// Render a BSON value back to JSON, keeping ObjectIds and dates as
/// extended-JSON wrappers.
pub fn bson_to_json(bson: Bson) -> Value {
    bson.into_relaxed_extjson()
}

/// Render a BSON document back to JSON.
pub fn document_to_json(doc: Document) -> Value {
    Bson::Document(doc).into_relaxed_extjson()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId};
    use serde_json::json;

    #[test]
    fn object_ids_survive_the_round_trip() {
        let id = ObjectId::new();
        let frame = json!({"filter": {"_id": {"$oid": id.to_hex()}}});

        let doc = json_to_document(&frame).unwrap();
        assert_eq!(doc.get_document("filter").unwrap().get_object_id("_id").unwrap(), id);

        let back = document_to_json(doc);
        assert_eq!(back["filter"]["_id"]["$oid"], json!(id.to_hex()));
    }

    #[test]
    fn plain_json_converts_without_wrapping() {
        let frame = json!({"name": "Sonu", "limit": 5, "flags": [true, false]});
        let doc = json_to_document(&frame).unwrap();
        assert_eq!(doc.get_str("name").unwrap(), "Sonu");
        let limit = doc
            .get_i64("limit")
            .unwrap_or_else(|_| doc.get_i32("limit").unwrap() as i64);
        assert_eq!(limit, 5);
    }

    #[test]
    fn non_documents_are_rejected() {
        assert!(json_to_document(&json!(42)).is_err());
        assert!(json_to_document(&json!(["a"])).is_err());
    }

    #[test]
    fn dates_render_as_extended_json() {
        let doc = doc! {"createdAt": mongodb::bson::DateTime::from_millis(1_700_000_000_000)};
        let value = document_to_json(doc);
        assert!(value["createdAt"].get("$date").is_some());
    }
}
