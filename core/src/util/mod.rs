mod ring;

pub use ring::{tail_lines, OutputCapture};
