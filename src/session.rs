//! Raw byte echo session.
//!
//! Reads up to [`CHUNK_SIZE`] bytes at a time and writes each chunk back in
//! full before reading again. There is no framing: the peer sees its own bytes
//! in order, but chunk boundaries follow the read size, not the sender's
//! writes.
//!
//! The session owns its stream. Dropping it on return closes the connection on
//! every path, including errors.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::info;

/// Bytes requested per read.
pub const CHUNK_SIZE: usize = 128;

/// What one session moved before the peer hung up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Total bytes echoed.
    pub bytes: u64,
    /// Number of non-empty reads.
    pub chunks: u64,
}

/// Echo everything read from `stream` back to it until the peer closes.
///
/// `Interrupted` reads and writes are retried in place; any other I/O error
/// ends the session. Raw chunk bytes are copied to `mirror` on a best-effort
/// basis.
pub fn run<S, M>(mut stream: S, peer: SocketAddr, mirror: &mut M) -> io::Result<SessionStats>
where
    S: Read + Write,
    M: Write + ?Sized,
{
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut stats = SessionStats::default();

    loop {
        let n = match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        info!(peer = %peer, bytes = n, "Received chunk");
        mirror_chunk(mirror, &buffer[..n]);

        send_all(&mut stream, &buffer[..n])?;

        stats.bytes += n as u64;
        stats.chunks += 1;
    }

    drop(stream);
    info!(
        peer = %peer,
        bytes = stats.bytes,
        chunks = stats.chunks,
        "Client disconnected"
    );
    Ok(stats)
}

/// Write the whole chunk, looping over short writes.
fn send_all<S: Write + ?Sized>(stream: &mut S, mut chunk: &[u8]) -> io::Result<()> {
    while !chunk.is_empty() {
        match stream.write(chunk) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => chunk = &chunk[n..],
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

const MIRROR_OPEN: &[u8] = b"<<<<<<\n";
const MIRROR_CLOSE: &[u8] = b"\n>>>>>>\n";

/// Copy one chunk to the mirror as a single framed write.
///
/// The frame goes out in one `write_all` so that sessions sharing stdout
/// (which locks per call) never interleave inside each other's frames.
fn mirror_chunk<M: Write + ?Sized>(mirror: &mut M, chunk: &[u8]) {
    let mut frame = Vec::with_capacity(MIRROR_OPEN.len() + chunk.len() + MIRROR_CLOSE.len());
    frame.extend_from_slice(MIRROR_OPEN);
    frame.extend_from_slice(chunk);
    frame.extend_from_slice(MIRROR_CLOSE);

    // Best effort: a broken diagnostic stream must not end the session.
    let _ = mirror.write_all(&frame).and_then(|_| mirror.flush());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// In-memory peer: reads come from `input`, writes land in `output`.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
        /// Interrupt this many reads before serving data.
        read_interrupts: usize,
        /// Interrupt this many writes before accepting data.
        write_interrupts: usize,
        /// Cap on bytes accepted per write call.
        max_write: usize,
        reads: usize,
    }

    impl Duplex {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
                read_interrupts: 0,
                write_interrupts: 0,
                max_write: usize::MAX,
                reads: 0,
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.read_interrupts > 0 {
                self.read_interrupts -= 1;
                return Err(io::ErrorKind::Interrupted.into());
            }
            self.reads += 1;
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_interrupts > 0 {
                self.write_interrupts -= 1;
                return Err(io::ErrorKind::Interrupted.into());
            }
            let n = buf.len().min(self.max_write);
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer shared between threads, locked once per `write` call like stdout.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_echo_is_byte_exact() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(777).collect();
        let mut duplex = Duplex::new(&payload);

        let stats = run(&mut duplex, peer(), &mut io::sink()).unwrap();
        assert_eq!(duplex.output, payload);
        assert_eq!(stats.bytes, 777);
    }

    #[test]
    fn test_empty_session() {
        let mut duplex = Duplex::new(b"");
        let stats = run(&mut duplex, peer(), &mut io::sink()).unwrap();
        assert!(duplex.output.is_empty());
        assert_eq!(stats, SessionStats::default());
    }

    #[test]
    fn test_thousand_bytes_take_eight_chunks() {
        let payload = vec![0x5a; 1000];
        let mut duplex = Duplex::new(&payload);

        let stats = run(&mut duplex, peer(), &mut io::sink()).unwrap();
        assert_eq!(stats.chunks, 8);
        assert_eq!(duplex.reads, 9); // eight chunks plus the EOF read
        assert_eq!(duplex.output, payload);
    }

    #[test]
    fn test_interrupted_calls_are_retried() {
        let mut duplex = Duplex::new(b"hello world");
        duplex.read_interrupts = 3;
        duplex.write_interrupts = 2;

        run(&mut duplex, peer(), &mut io::sink()).unwrap();
        assert_eq!(duplex.output, b"hello world");
    }

    #[test]
    fn test_short_writes_are_completed() {
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let mut duplex = Duplex::new(&payload);
        duplex.max_write = 7;

        let stats = run(&mut duplex, peer(), &mut io::sink()).unwrap();
        assert_eq!(duplex.output, payload);
        assert_eq!(stats.chunks, 3);
    }

    #[test]
    fn test_zero_write_is_an_error() {
        let mut duplex = Duplex::new(b"abc");
        duplex.max_write = 0;

        let err = run(&mut duplex, peer(), &mut io::sink()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_mirror_receives_payload() {
        let mut duplex = Duplex::new(b"ping");
        let mut mirror = Vec::new();

        run(&mut duplex, peer(), &mut mirror).unwrap();
        assert_eq!(mirror, b"<<<<<<\nping\n>>>>>>\n");
    }

    #[test]
    fn test_concurrent_mirrors_keep_frames_whole() {
        let sink = SharedSink::default();

        let sessions: Vec<_> = [b'a', b'b']
            .into_iter()
            .map(|fill| {
                let mut mirror = sink.clone();
                thread::spawn(move || {
                    let mut duplex = Duplex::new(&vec![fill; CHUNK_SIZE * 40]);
                    run(&mut duplex, peer(), &mut mirror).unwrap();
                })
            })
            .collect();
        for session in sessions {
            session.join().unwrap();
        }

        let mirrored = sink.0.lock().unwrap();
        let frame_len = MIRROR_OPEN.len() + CHUNK_SIZE + MIRROR_CLOSE.len();
        assert_eq!(mirrored.len(), frame_len * 80);

        for frame in mirrored.chunks(frame_len) {
            assert!(frame.starts_with(MIRROR_OPEN));
            assert!(frame.ends_with(MIRROR_CLOSE));
            let body = &frame[MIRROR_OPEN.len()..MIRROR_OPEN.len() + CHUNK_SIZE];
            assert!(
                body.iter().all(|&b| b == body[0]),
                "frame holds bytes from both sessions"
            );
        }
    }

    #[test]
    fn test_chunk_size_logged_at_info() {
        let sink = SharedSink::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut duplex = Duplex::new(b"ping");
            run(&mut duplex, peer(), &mut io::sink()).unwrap();
        });

        let logged = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(
            logged
                .lines()
                .any(|line| line.contains("Received chunk") && line.contains("bytes=4")),
            "no chunk line in: {logged}"
        );
    }

    #[test]
    fn test_echo_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, peer) = listener.accept().unwrap();
            run(stream, peer, &mut io::sink()).unwrap()
        });

        let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&payload).unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, payload);

        let stats = server.join().unwrap();
        assert_eq!(stats.bytes, 1000);
    }
}
