//! `text/event-stream` encoding.
//!
//! An event may arrive in several fragments. The `INIT` fragment writes the
//! event fields and opens the `data:` field, middle fragments continue it and
//! the `FIN` fragment closes the event with a blank line. Fields of a `FIN`
//! fragment that did not start the event follow its data.

use micro_fabric::flags;

/// Upper bound of the field overhead an event adds to its data.
pub const MAXIMUM_HEADER_SIZE: u32 = 5 + 3 + 255 + 6 + 16 + 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFields<'a> {
    pub comment: Option<&'a str>,
    pub retry: Option<u32>,
    /// Written as `timestamp:0x<hex>` when non zero.
    pub timestamp: u64,
    pub id: Option<&'a str>,
    pub event_type: Option<&'a str>,
}

pub fn encode_event(dst: &mut Vec<u8>, fragment: u8, fields: &EventFields<'_>, data: Option<&[u8]>) {
    let init = fragment & flags::INIT != 0;
    let fin = fragment & flags::FIN != 0;

    if init {
        encode_fields(dst, fields);
        if let Some(data) = data {
            dst.extend_from_slice(b"data:");
            encode_data(dst, data);
            if fin {
                dst.push(b'\n');
            }
        }
    } else {
        if let Some(data) = data {
            encode_data(dst, data);
        }
        if fin {
            dst.push(b'\n');
            encode_fields(dst, fields);
        }
    }

    if fin {
        dst.push(b'\n');
    }
}

fn encode_fields(dst: &mut Vec<u8>, fields: &EventFields<'_>) {
    if let Some(comment) = fields.comment {
        encode_field(dst, b":", comment.as_bytes());
    }
    if let Some(retry) = fields.retry {
        encode_field(dst, b"retry:", retry.to_string().as_bytes());
    }
    if fields.timestamp != 0 {
        encode_field(dst, b"timestamp:", format!("0x{:x}", fields.timestamp).as_bytes());
    }
    if let Some(id) = fields.id {
        encode_field(dst, b"id:", id.as_bytes());
    }
    if let Some(event_type) = fields.event_type {
        encode_field(dst, b"event:", event_type.as_bytes());
    }
}

fn encode_field(dst: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    dst.extend_from_slice(name);
    dst.extend_from_slice(value);
    dst.push(b'\n');
}

/// Every line feed in `data` starts a new `data:` field.
fn encode_data(dst: &mut Vec<u8>, data: &[u8]) {
    let mut lines = data.split(|&b| b == b'\n');
    if let Some(first) = lines.next() {
        dst.extend_from_slice(first);
    }
    for line in lines {
        dst.extend_from_slice(b"\ndata:");
        dst.extend_from_slice(line);
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn encoded(fragment: u8, fields: &EventFields<'_>, data: Option<&[u8]>) -> String {
        let mut dst = Vec::new();
        encode_event(&mut dst, fragment, fields, data);
        String::from_utf8(dst).unwrap()
    }

    #[test]
    fn test_complete_event() {
        let fields = EventFields { id: Some("7"), event_type: Some("update"), timestamp: 0x1f4, ..Default::default() };
        assert_eq!(
            encoded(flags::COMPLETE, &fields, Some(b"hello")),
            indoc! {"
                timestamp:0x1f4
                id:7
                event:update
                data:hello

            "}
        );
    }

    #[test]
    fn test_multiline_data() {
        assert_eq!(encoded(flags::COMPLETE, &EventFields::default(), Some(b"a\nb\n")), "data:a\ndata:b\ndata:\n\n");
    }

    #[test]
    fn test_comment_and_retry() {
        let fields = EventFields { comment: Some("welcome"), retry: Some(2500), ..Default::default() };
        assert_eq!(encoded(flags::COMPLETE, &fields, None), ":welcome\nretry:2500\n\n");
    }

    #[test]
    fn test_id_only() {
        let fields = EventFields { id: Some("last"), ..Default::default() };
        assert_eq!(encoded(flags::COMPLETE, &fields, None), "id:last\n\n");
    }

    #[test]
    fn test_fragments() {
        let mut dst = Vec::new();
        encode_event(&mut dst, flags::INIT, &EventFields { event_type: Some("big"), ..Default::default() }, Some(b"ab"));
        encode_event(&mut dst, 0, &EventFields::default(), Some(b"c\nd"));
        encode_event(&mut dst, flags::FIN, &EventFields { id: Some("9"), ..Default::default() }, Some(b"e"));

        assert_eq!(String::from_utf8(dst).unwrap(), "event:big\ndata:abc\ndata:de\nid:9\n\n");
    }
}
