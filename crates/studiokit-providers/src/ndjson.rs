use serde_json::Value;

/// Incremental newline-delimited JSON splitter. Malformed lines are counted and dropped.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    skipped: usize,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every complete line that parsed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(v) = self.parse_line(&line) {
                out.push(v);
            }
        }
        out
    }

    /// Parses whatever is left once the stream closed.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buf);
        self.parse_line(&rest)
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn parse_line(&mut self, raw: &[u8]) -> Option<Value> {
        let text = String::from_utf8_lossy(raw);
        let t = text.trim();
        if t.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(t) {
            Ok(v) => Some(v),
            Err(_) => {
                self.skipped += 1;
                None
            }
        }
    }
}
