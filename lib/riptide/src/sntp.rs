use byteorder::{BigEndian, ByteOrder};
use keel::{ErrorKind, NetError, NetResult};

/// Seconds between the NTP epoch (1900) and the unix epoch (1970).
const NTP_UNIX_DELTA: u64 = 2_208_988_800;

/// Builds an SNTP v4 client request: LI=0, VN=4, mode=3 (client), all
/// timestamps zero.
pub(crate) fn request() -> [u8; 48] {
    let mut packet = [0u8; 48];
    packet[0] = (4 << 3) | 3;
    packet
}

/// Parses a server reply into unix epoch milliseconds taken from the
/// transmit timestamp.
pub(crate) fn parse_reply(buf: &[u8]) -> NetResult<u64> {
    if buf.len() < 48 {
        return Err(NetError::Wait);
    }

    let mode = buf[0] & 0x07;
    let version = (buf[0] >> 3) & 0x07;

    if mode != 4 && mode != 5 {
        return Err(NetError::Fatal(ErrorKind::Parse("not a server reply")));
    }
    if version < 3 || version > 4 {
        return Err(NetError::Fatal(ErrorKind::Parse("unsupported sntp version")));
    }
    // Stratum 0 is a kiss-of-death packet.
    if buf[1] == 0 {
        return Err(NetError::Fatal(ErrorKind::Parse("kiss of death")));
    }

    let seconds = u64::from(BigEndian::read_u32(&buf[40..44]));
    let fraction = u64::from(BigEndian::read_u32(&buf[44..48]));

    if seconds < NTP_UNIX_DELTA {
        return Err(NetError::Fatal(ErrorKind::Parse("timestamp before unix epoch")));
    }

    Ok((seconds - NTP_UNIX_DELTA) * 1000 + ((fraction * 1000) >> 32))
}
