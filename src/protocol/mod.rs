pub mod packet;
pub mod response;

pub use packet::{Frame, FrameCodec, FrameHeader, HEADER_SIZE, encode_frame};
pub use response::Response;
