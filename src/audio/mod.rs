// Audio Module
//
// Split into focused files:
// - buffer.rs: In-memory mono sample buffer and time-based slicing
// - wav.rs: WAV read/write through hound
// - decode.rs: Input file decoding (native WAV or FFmpeg conversion)

pub mod buffer;
pub mod decode;
pub mod wav;

pub use buffer::AudioBuffer;
pub use decode::{decode_audio_file, find_ffmpeg_path};
pub use wav::{read_wav, write_wav};
