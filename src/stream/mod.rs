/// Wire format shared by the chat server and its clients.
///
/// One response body carries a sequence of `data: ` lines, each holding a
/// JSON payload (`content`, `trace` or `auditReport`) or the `[DONE]` end
/// marker.
///
/// - `codec` - event encoding/decoding and the byte-level line buffer
/// - `reader` - the loop that turns a byte stream into ordered events
mod codec;
mod reader;

pub use codec::{
    CodecError, DATA_PREFIX, DONE_MARKER, LineBuffer, StreamEvent, decode_line, encode_line,
};
pub use reader::{ReadError, ReadSummary, read_events};
