//! Incremental Server-Sent Events decoder
//!
//! Bytes arrive in arbitrary chunks; events are dispatched on a blank line.
//! Only the `event` and `data` fields are kept, which is all the realtime
//! database emits.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete event, if the buffered bytes contain one
    pub fn next_event(&mut self) -> Option<SseEvent> {
        while let Some(end) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if self.event.is_none() && self.data.is_empty() {
                    continue;
                }
                return Some(SseEvent {
                    event: self.event.take().unwrap_or_else(|| "message".to_string()),
                    data: std::mem::take(&mut self.data).join("\n"),
                });
            }

            // comment line
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks() {
        let mut d = SseDecoder::new();
        d.push(b"event: put\ndata: {\"path\":\"/\",");
        assert_eq!(d.next_event(), None);

        d.push(b"\"data\":null}\r\n\r\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(
            d.next_event(),
            Some(SseEvent { event: "put".into(), data: r#"{"path":"/","data":null}"#.into() })
        );
        assert_eq!(d.next_event(), Some(SseEvent { event: "keep-alive".into(), data: "null".into() }));
        assert_eq!(d.next_event(), None);
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut d = SseDecoder::new();
        d.push(b": comment\ndata: a\ndata: b\n\n");
        assert_eq!(d.next_event(), Some(SseEvent { event: "message".into(), data: "a\nb".into() }));
    }
}
