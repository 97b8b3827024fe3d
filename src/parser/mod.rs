//!
//! This module defines how to turn raw block bytes into Block structs
//! and output scripts into addresses.
//!

/// address payloads and their text forms
pub mod address;

/// block decoding, both from blk files and from live submissions
pub mod block;

/// locate and read blk.dat files
pub mod blk_file;

/// sequential byte reader
pub mod reader;

/// output script classification
pub mod script;

/// decoded block and transaction records
pub mod proto;

/// error handling
pub mod errors;
