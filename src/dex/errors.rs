use super::DexOpcode;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),

    /// The code unit does not start any supported instruction
    UnknownOpcode { addr: u32, code_unit: u16 },

    /// An instruction or payload runs past the end of the instruction array
    TruncatedInstruction { addr: u32, opcode: Option<DexOpcode> },

    /// `invoke` with more arguments than the `35c` format can carry
    TooManyArguments { addr: u32, count: u8 },

    /// A try item points at a handler list offset that does not start a handler
    BadHandlerOffset(u16),

    /// ULEB128/SLEB128 value longer than five bytes
    MalformedLeb128,

    /// Trailing bytes after the `code_item`
    TrailingData(usize),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}
