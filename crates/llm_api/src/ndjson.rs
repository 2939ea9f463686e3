use serde_json::Value;

use crate::error::LlmApiError;

/// Incremental parser for newline-delimited JSON streams.
#[derive(Debug, Default)]
pub struct NdjsonStreamParser {
    buffer: Vec<u8>,
}

impl NdjsonStreamParser {
    /// Feed bytes and drain every complete JSON line.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Value>, LlmApiError> {
        self.buffer.extend_from_slice(bytes);
        let mut values = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            if let Some(value) = parse_line(&line)? {
                values.push(value);
            }
        }

        Ok(values)
    }

    /// Parses a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Result<Option<Value>, LlmApiError> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Result<Option<Value>, LlmApiError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|error| LlmApiError::malformed(format!("invalid NDJSON line: {error}")))
}
