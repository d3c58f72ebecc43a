use std::io;

/// Bytes read off the socket per ingress step.
pub const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Outbound bytes of a single request together with the send progress.
/// Produced by the data source and owned exclusively by the connection while
/// the request is in flight.
pub struct WriteBuffer {
    request: String,
    payload: Vec<u8>,
    offset: usize,
    started: bool,
}

impl WriteBuffer {
    #[inline]
    pub fn new(request: impl Into<String>, payload: Vec<u8>) -> WriteBuffer {
        WriteBuffer {
            request: request.into(),
            payload,
            offset: 0,
            started: false,
        }
    }

    /// Identifier of the request this buffer belongs to.
    #[inline]
    pub fn request_identifier(&self) -> &str {
        &self.request
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// True while unsent bytes remain.
    #[inline]
    pub fn has_data(&self) -> bool {
        self.offset < self.payload.len()
    }

    /// True once some, but not all, bytes have been shipped.
    #[inline]
    pub fn is_partially_sent(&self) -> bool {
        self.offset > 0 && self.has_data()
    }

    /// Whether the data source has already been told processing started.
    #[inline]
    pub fn started(&self) -> bool {
        self.started
    }

    #[inline]
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    /// Performs a single write of the remaining range, advancing the offset
    /// by however many bytes the destination accepted.
    #[inline]
    pub fn write_to<W: io::Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let written = writer.write(&self.payload[self.offset..])?;
        self.offset += written;

        debug_assert!(self.offset <= self.payload.len());

        Ok(written)
    }
}

/// Growable accumulator for inbound response bytes. Data is appended at the
/// tail as it arrives off the socket and consumed from the head by the
/// response collaborator.
pub struct Accumulator {
    data: Vec<u8>,
}

impl Accumulator {
    #[inline]
    pub fn new() -> Accumulator {
        Accumulator { data: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Reads one chunk from the supplied reader and appends the actually
    /// read range. Returns the number of bytes appended; zero signals end of
    /// stream.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let read = reader.read(&mut chunk)?;

        self.data.extend_from_slice(&chunk[..read]);

        Ok(read)
    }

    /// Removes `count` bytes from the head of the accumulator.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.data.drain(..count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        accepted: Vec<u8>,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                accepted: Vec::new(),
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..(self.cursor + count)]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let count = min(self.chunk, buf.len());
            self.accepted.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_buffer_full_write() {
        let mut channel = MockChannel::new(Vec::new(), 1024);
        let mut buffer = WriteBuffer::new("req-1", vec![7u8; 100]);

        assert!(buffer.has_data());
        assert!(!buffer.is_partially_sent());

        let written = buffer.write_to(&mut channel).unwrap();

        assert_eq!(written, 100);
        assert!(!buffer.has_data());
        assert!(!buffer.is_partially_sent());
        assert_eq!(channel.accepted.len(), 100);
    }

    #[test]
    fn test_write_buffer_partial_accounting() {
        let mut channel = MockChannel::new(Vec::new(), 32);
        let mut buffer = WriteBuffer::new("req-1", (0..100).collect());

        let mut total = 0;
        let mut previous_offset = 0;

        while buffer.has_data() {
            total += buffer.write_to(&mut channel).unwrap();

            assert!(buffer.offset() >= previous_offset);
            previous_offset = buffer.offset();
        }

        assert_eq!(total, 100);
        assert!(!buffer.is_partially_sent());
        assert_eq!(channel.accepted, (0..100).collect::<Vec<u8>>());
    }

    #[test]
    fn test_write_buffer_partially_sent() {
        let mut channel = MockChannel::new(Vec::new(), 32);
        let mut buffer = WriteBuffer::new("req-1", vec![1u8; 100]);

        buffer.write_to(&mut channel).unwrap();

        assert_eq!(buffer.offset(), 32);
        assert!(buffer.is_partially_sent());
    }

    #[test]
    fn test_accumulator_chunked_ingress() {
        let expected: Vec<u8> = (0..40_000u32).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(expected.clone(), READ_CHUNK_SIZE);
        let mut accumulator = Accumulator::new();

        assert_eq!(accumulator.ingress(&mut channel).unwrap(), READ_CHUNK_SIZE);
        assert_eq!(
            accumulator.ingress(&mut channel).unwrap(),
            40_000 - READ_CHUNK_SIZE
        );

        let drained = accumulator.ingress(&mut channel);

        assert_eq!(drained.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(accumulator.as_slice(), &expected[..]);
    }

    #[test]
    fn test_accumulator_consume() {
        let mut accumulator = Accumulator::new();

        accumulator.ingress(&b"HTTP/1.1 200 OK\r\n"[..]).unwrap();
        accumulator.consume(9);

        assert_eq!(accumulator.as_slice(), b"200 OK\r\n");

        accumulator.clear();

        assert!(accumulator.is_empty());
    }

    #[test]
    fn test_accumulator_eof() {
        let mut accumulator = Accumulator::new();

        assert_eq!(accumulator.ingress(&b""[..]).unwrap(), 0);
    }
}
