use crate::buffer::Buffer;
use keel::NetResult;

/// Certificate material handed to the TLS strategy verbatim. The runtime
/// never interprets any of these fields.
#[derive(Debug, Clone, Default)]
pub struct TlsOpts {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    /// Server name for SNI.
    pub name: Option<String>,
    pub skip_verification: bool,
}

/// Handshake progress reported by the strategy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HsStatus {
    NeedsMore,
    Done,
    Failed,
}

/// The pluggable TLS state machine. The driver routes bytes through these
/// hooks whenever a connection carries the `tls` flag: `handshake` runs
/// while `tls_hs` is set, after which inbound ciphertext goes through
/// `read` and outbound plaintext through `write`.
///
/// `recv` always holds ciphertext from the wire; anything written to `send`
/// is shipped to the wire unmodified.
pub trait TlsHooks {
    /// One-time setup with the options supplied at listen/connect time.
    fn init(&mut self, opts: &TlsOpts) -> NetResult<()>;

    /// Advances the handshake, consuming ciphertext from `recv` and
    /// producing handshake ciphertext into `send`.
    fn handshake(&mut self, recv: &mut Buffer, send: &mut Buffer) -> HsStatus;

    /// Decrypts buffered ciphertext, consuming what it uses. Returns the
    /// recovered plaintext (possibly empty when a record is incomplete).
    fn read(&mut self, recv: &mut Buffer) -> NetResult<Vec<u8>>;

    /// Encrypts plaintext into wire-ready ciphertext.
    fn write(&mut self, plaintext: &[u8]) -> NetResult<Vec<u8>>;

    /// Tears down session state. Called exactly once, before socket close.
    fn free(&mut self);
}
