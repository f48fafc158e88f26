//! Services separating I/O from the processing pipeline

pub mod io;

pub use io::{encode_png, UploadedImage};
