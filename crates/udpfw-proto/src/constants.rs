/// First byte of every frame on the wire.
/// A non-zero byte outside a frame boundary is treated as garbage.
pub const FRAME_PREFIX: u8 = 0x00;

/// Magic embedded in every HELLO frame, between the kind tag and the
/// payload length. Lets the server reject unrelated TCP clients before
/// any state is allocated for them.
pub const HELLO_MAGIC: [u8; 8] = *b"\x00!UDPFW\x00";

/// Maximum payload carried by a single frame. The length field is u16.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Fixed width of the client id embedded in bus envelopes.
/// The id generator always produces 22 printable ASCII characters.
pub const SOURCE_LEN: usize = 22;

/// Server-side namespace used when a client subscribes with an empty name.
pub const GLOBAL_NAMESPACE: &str = "$$global";
