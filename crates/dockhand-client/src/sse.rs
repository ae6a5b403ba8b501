/// One dispatched Server-Sent Events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    /// `data:` lines joined with `\n`; `None` for comment-only frames such
    /// as keep-alives.
    pub data: Option<String>,
}

/// Removes the first complete frame from `buffer`. Returns `None` until a
/// blank-line delimiter has arrived. Handles `\n` and `\r\n` framing.
pub fn parse_sse_frame(buffer: &mut String) -> Option<SseFrame> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    let (end_idx, delim_len) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };

    let raw: String = buffer.drain(..end_idx + delim_len).collect();
    let mut frame = SseFrame {
        event: None,
        id: None,
        data: None,
    };
    let mut data_lines: Vec<&str> = Vec::new();
    for line in raw[..end_idx].lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "event" => frame.event = Some(value.to_string()),
            "id" => frame.id = Some(value.to_string()),
            _ => {}
        }
    }
    if !data_lines.is_empty() {
        frame.data = Some(data_lines.join("\n"));
    }
    Some(frame)
}
