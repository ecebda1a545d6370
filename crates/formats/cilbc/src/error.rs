/// Errors produced while decoding a method body.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unexpected end of IL stream at offset {offset} (need {need} bytes, have {have})")]
    UnexpectedEof {
        offset: usize,
        need: usize,
        have: usize,
    },

    #[error("unknown opcode byte {byte:#04x} at offset {offset}")]
    UnknownOpcode { byte: u8, offset: usize },

    #[error("unknown prefixed opcode byte 0xfe {byte:#04x} at offset {offset}")]
    UnknownPrefixedOpcode { byte: u8, offset: usize },

    #[error("switch at offset {offset} declares {count} targets, exceeding the body length")]
    OversizedSwitch { offset: usize, count: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
