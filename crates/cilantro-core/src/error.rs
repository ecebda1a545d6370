/// Errors raised by the shared compilation model.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unresolved token {token:#010x}")]
    UnresolvedToken { token: u32 },

    #[error("token {token:#010x} resolves to a {found}, expected a {expected}")]
    TokenKind {
        token: u32,
        expected: &'static str,
        found: &'static str,
    },

    #[error("explicit-layout field `{field}` carries no offset")]
    MissingFieldOffset { field: String },

    #[error("type `{ty}` has no computable size")]
    UnsizedType { ty: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
