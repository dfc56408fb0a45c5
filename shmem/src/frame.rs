//! Text framing the publisher and subscriber put at the front of each
//! payload: `"Message #<counter> <timestamp_us>"`, NUL padded.
//!
//! The queue itself never looks at these bytes.

pub const DEFAULT_HEADER_SIZE: usize = 64;

const PREFIX: &str = "Message #";

/// Writes the frame header into the first `header_size` bytes of `buf`
/// and returns the number of text bytes written (truncated if needed).
pub fn write_header(buf: &mut [u8], counter: u64, timestamp_us: u64, header_size: usize) -> usize {
    let window = header_size.min(buf.len());
    let text = format!("{}{} {}", PREFIX, counter, timestamp_us);
    let n = text.len().min(window);
    buf[..n].copy_from_slice(&text.as_bytes()[..n]);
    for b in &mut buf[n..window] {
        *b = 0;
    }
    n
}

/// Returns `(counter, timestamp_us)` if `buf` starts with a frame header.
pub fn parse_header(buf: &[u8]) -> Option<(u64, u64)> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let text = std::str::from_utf8(&buf[..end]).ok()?;
    let rest = text.strip_prefix(PREFIX)?;
    let mut fields = rest.split_whitespace();
    let counter = fields.next()?.parse().ok()?;
    let timestamp = fields.next()?.parse().ok()?;
    Some((counter, timestamp))
}

/// Microseconds on `CLOCK_MONOTONIC`, which is shared by all processes
/// on the host.
pub fn mono_time_us() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}
