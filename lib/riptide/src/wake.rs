use crate::buffer::Buffer;
use byteorder::{BigEndian, ByteOrder};
use keel::NetResult;
use std::io::Write;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::{Arc, Mutex};

/// Frame header: 8-byte connection id + 4-byte payload length.
const RECORD_HEADER: usize = 12;

/// Thread-safe producer half of the wakeup channel. Cloneable and callable
/// from any thread; each call writes one framed record that the loop
/// thread delivers as a WAKEUP event on the target connection.
#[derive(Clone)]
pub struct WakeupSender {
    tx: Arc<Mutex<StdUnixStream>>,
}

impl WakeupSender {
    /// Queues a wakeup for connection `id`. Blocks briefly if the loopback
    /// channel is at capacity; the frame is always written atomically with
    /// respect to other senders.
    pub fn wakeup(&self, id: u64, payload: &[u8]) -> NetResult<()> {
        let mut frame = Vec::with_capacity(RECORD_HEADER + payload.len());
        frame.extend_from_slice(&id.to_be_bytes());

        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, payload.len() as u32);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(payload);

        let mut guard = self.tx.lock().expect("wakeup sender lock poisoned");
        guard.write_all(&frame)?;
        Ok(())
    }
}

/// Creates the loopback pair: a non-blocking reader registered as a
/// pseudo-connection inside the I/O driver, and the blocking writer wrapped
/// into a `WakeupSender`. The writer blocks instead of tearing frames when
/// the channel fills.
pub(crate) fn channel() -> NetResult<(mio::net::UnixStream, WakeupSender)> {
    let (reader, writer) = StdUnixStream::pair()?;
    reader.set_nonblocking(true)?;

    let sender = WakeupSender {
        tx: Arc::new(Mutex::new(writer)),
    };

    Ok((mio::net::UnixStream::from_std(reader), sender))
}

/// Drains complete records from the pseudo-connection's recv buffer.
pub(crate) fn parse_records(recv: &mut Buffer) -> Vec<(u64, Vec<u8>)> {
    let mut records = Vec::new();

    loop {
        let buf = recv.read_slice();
        if buf.len() < RECORD_HEADER {
            return records;
        }

        let id = BigEndian::read_u64(&buf[..8]);
        let len = BigEndian::read_u32(&buf[8..12]) as usize;

        if buf.len() < RECORD_HEADER + len {
            return records;
        }

        records.push((id, buf[RECORD_HEADER..RECORD_HEADER + len].to_vec()));
        recv.consume(RECORD_HEADER + len);
    }
}
