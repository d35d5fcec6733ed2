// Binary primitives shared by the tables, entries and protocol layers.

pub mod reader;
pub mod varint;
pub mod writer;

pub use reader::{BinaryReader, ReadError};
pub use varint::VarIntError;
pub use writer::BinaryWriter;
