#![forbid(unsafe_code)]

//! ID3v2 tag scanning for elementary audio streams.
//!
//! Elementary AAC and MP3 segments commonly lead with one or more ID3 tags;
//! Apple's packager also embeds the segment's transport-stream timestamp in
//! a `PRIV` frame, which anchors timestamp generation for streams that have
//! no container timestamps of their own.

const HEADER_LEN: usize = 10;
const FOOTER_FLAG: u8 = 0x10;

/// Owner identifier of the Apple timestamp `PRIV` frame.
const TIMESTAMP_OWNER: &[u8] = b"com.apple.streaming.transportStreamTimestamp\0";

/// True when a syntactically valid ID3v2 header starts at `offset`.
pub fn is_header(data: &[u8], offset: usize) -> bool {
    let Some(header) = data.get(offset..offset + HEADER_LEN) else {
        return false;
    };
    header[0] == b'I'
        && header[1] == b'D'
        && header[2] == b'3'
        && header[3] < 0xFF
        && header[4] < 0xFF
        && header[6] < 0x80
        && header[7] < 0x80
        && header[8] < 0x80
        && header[9] < 0x80
}

/// Total byte length of the run of consecutive ID3 tags at the start of `data`.
pub fn tags_len(data: &[u8]) -> usize {
    let mut pos = 0;
    while is_header(data, pos) {
        let size = syncsafe(&data[pos + 6..pos + 10]);
        let footer = data[pos + 5] & FOOTER_FLAG != 0;
        pos += HEADER_LEN + size + if footer { HEADER_LEN } else { 0 };
        if pos > data.len() {
            // declared size runs past the buffer; treat the tag as absent
            return 0;
        }
    }
    pos
}

/// Extract the transport-stream timestamp (90 kHz ticks) from the leading
/// ID3 tag, if its `PRIV` frame is present.
pub fn timestamp(data: &[u8]) -> Option<i64> {
    if !is_header(data, 0) {
        return None;
    }
    let tag_size = syncsafe(&data[6..10]);
    let end = (HEADER_LEN + tag_size).min(data.len());
    let mut pos = HEADER_LEN;
    while pos + HEADER_LEN <= end {
        let id = &data[pos..pos + 4];
        let size = syncsafe(&data[pos + 4..pos + 8]);
        let body = data.get(pos + HEADER_LEN..pos + HEADER_LEN + size)?;
        if id == b"PRIV"
            && let Some(payload) = body.strip_prefix(TIMESTAMP_OWNER)
            && payload.len() >= 8
        {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&payload[..8]);
            // 33-bit MPEG timestamp in the low bits of a 64-bit field
            return Some((u64::from_be_bytes(raw) & 0x1_FFFF_FFFF) as i64);
        }
        pos += HEADER_LEN + size;
        if size == 0 {
            break;
        }
    }
    None
}

fn syncsafe(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .fold(0usize, |acc, &b| (acc << 7) | usize::from(b & 0x7F))
}

#[cfg(test)]
pub(crate) fn make_tag(frames: &[(&[u8; 4], Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (id, frame) in frames {
        body.extend_from_slice(*id);
        let size = frame.len();
        body.extend_from_slice(&[
            ((size >> 21) & 0x7F) as u8,
            ((size >> 14) & 0x7F) as u8,
            ((size >> 7) & 0x7F) as u8,
            (size & 0x7F) as u8,
        ]);
        body.extend_from_slice(&[0, 0]); // frame flags
        body.extend_from_slice(frame);
    }
    let mut tag = vec![b'I', b'D', b'3', 4, 0, 0];
    let size = body.len();
    tag.extend_from_slice(&[
        ((size >> 21) & 0x7F) as u8,
        ((size >> 14) & 0x7F) as u8,
        ((size >> 7) & 0x7F) as u8,
        (size & 0x7F) as u8,
    ]);
    tag.extend_from_slice(&body);
    tag
}
