use serde::{Deserialize, Serialize};

/// Kind of a protected-region handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    /// `catch` with a class token constraint.
    Typed,
    /// `catch` guarded by a filter expression.
    Filter,
    Finally,
    Fault,
}

/// One row of the exception-region table. Offsets and lengths are byte
/// ranges into the IL stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRegion {
    pub kind: RegionKind,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    /// Class token for `Typed`, filter start offset for `Filter`.
    #[serde(default)]
    pub class_token_or_filter: u32,
}

impl ExceptionRegion {
    pub fn try_end(&self) -> u32 {
        self.try_offset + self.try_length
    }

    pub fn handler_end(&self) -> u32 {
        self.handler_offset + self.handler_length
    }

    /// Whether `offset` falls inside the protected (try) range.
    pub fn protects(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset < self.try_end()
    }
}

/// A method body as carried in the module description: raw IL plus the
/// sidecar tables the stream itself does not encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub il: Vec<u8>,
    /// Local variable types, as type tokens into the module token table.
    #[serde(default)]
    pub locals: Vec<u32>,
    #[serde(default)]
    pub init_locals: bool,
    #[serde(default)]
    pub regions: Vec<ExceptionRegion>,
    #[serde(default)]
    pub max_stack: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_ranges() {
        let r = ExceptionRegion {
            kind: RegionKind::Finally,
            try_offset: 2,
            try_length: 6,
            handler_offset: 8,
            handler_length: 3,
            class_token_or_filter: 0,
        };
        assert!(r.protects(2));
        assert!(r.protects(7));
        assert!(!r.protects(8));
        assert_eq!(r.handler_end(), 11);
    }
}
